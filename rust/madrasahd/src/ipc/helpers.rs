use crate::attendance::AttendanceError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;

/// Failure of a single handler, rendered into the error envelope.
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<AttendanceError> for HandlerErr {
    fn from(e: AttendanceError) -> Self {
        HandlerErr {
            code: e.code(),
            details: e.details(),
            message: e.to_string(),
        }
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!("{} must be string or null", key)));
            };
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
    }
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str, default: bool) -> Result<bool, HandlerErr> {
    match params.get(key) {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn get_string_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain strings", key)))
        })
        .collect()
}

pub type DbHandler = fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>;

/// Runs `f` against the open workspace and wraps the outcome in the envelope.
pub fn with_db(state: &AppState, req: &Request, f: DbHandler) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attendance_errors_keep_code_and_details() {
        let e: HandlerErr = AttendanceError::not_found_with("no session", json!({ "classId": "c1" })).into();
        let resp = e.response("7");
        assert_eq!(resp["ok"], json!(false));
        assert_eq!(resp["error"]["code"], json!("not_found"));
        assert_eq!(resp["error"]["details"]["classId"], json!("c1"));
    }

    #[test]
    fn required_str_rejects_blank() {
        assert!(get_required_str(&json!({ "a": "  " }), "a").is_err());
        assert_eq!(get_required_str(&json!({ "a": " x " }), "a").ok(), Some("x".to_string()));
        assert_eq!(get_optional_str(&json!({ "a": null }), "a").ok(), Some(None));
        assert!(get_string_list(&json!({ "a": ["x", 1] }), "a").is_err());
    }

    #[test]
    fn optional_bool_defaults_and_rejects_other_types() {
        assert_eq!(get_optional_bool(&json!({}), "a", true).ok(), Some(true));
        assert_eq!(get_optional_bool(&json!({ "a": null }), "a", false).ok(), Some(false));
        assert_eq!(get_optional_bool(&json!({ "a": false }), "a", true).ok(), Some(false));
        let e = get_optional_bool(&json!({ "a": "no" }), "a", true).err().expect("string rejected");
        assert_eq!(e.code, "bad_params");
    }
}
