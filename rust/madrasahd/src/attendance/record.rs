use super::error::{AttendanceError, AttendanceResult};
use super::status::AttendanceStatus;
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub entity_id: String,
    pub class_id: Option<String>,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub remarks: Option<String>,
    pub arrival_time: Option<NaiveTime>,
    pub departure_time: Option<NaiveTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl AttendanceRecord {
    #[cfg(test)]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            entity_id: self.entity_id.clone(),
            class_id: self.class_id.clone(),
            date: self.date,
        }
    }
}

/// The (entity, class, date) triple; at most one record exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub entity_id: String,
    pub class_id: Option<String>,
    pub date: NaiveDate,
}

/// Validated input for an upsert. Optional fields left as `None` keep the
/// stored value when the key already exists.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    pub entity_id: String,
    pub class_id: Option<String>,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub remarks: Option<String>,
    pub arrival_time: Option<NaiveTime>,
    pub departure_time: Option<NaiveTime>,
}

impl RecordDraft {
    pub fn new(
        entity_id: impl Into<String>,
        class_id: Option<String>,
        date: NaiveDate,
        status: AttendanceStatus,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            class_id,
            date,
            status,
            remarks: None,
            arrival_time: None,
            departure_time: None,
        }
    }

    pub fn with_remarks(mut self, remarks: Option<&str>) -> Self {
        self.remarks = normalize_remarks(remarks);
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            entity_id: self.entity_id.clone(),
            class_id: self.class_id.clone(),
            date: self.date,
        }
    }

    pub fn from_json(params: &serde_json::Value) -> AttendanceResult<Self> {
        let entity_id = required_id(params, "entityId")?;
        let class_id = optional_id(params, "classId")?;
        let date = parse_date(&required_str(params, "date")?)?;
        let status = AttendanceStatus::parse(&required_str(params, "status")?)?;
        let remarks = optional_str(params, "remarks")?;
        let arrival_time = optional_str(params, "arrivalTime")?
            .map(|s| parse_time(&s))
            .transpose()?;
        let departure_time = optional_str(params, "departureTime")?
            .map(|s| parse_time(&s))
            .transpose()?;
        if let (Some(a), Some(d)) = (arrival_time, departure_time) {
            if d < a {
                return Err(AttendanceError::validation_with(
                    "departureTime must not be before arrivalTime",
                    json!({ "arrivalTime": a.to_string(), "departureTime": d.to_string() }),
                ));
            }
        }
        Ok(Self {
            entity_id,
            class_id,
            date,
            status,
            remarks: normalize_remarks(remarks.as_deref()),
            arrival_time,
            departure_time,
        })
    }
}

pub fn normalize_remarks(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub fn parse_date(raw: &str) -> AttendanceResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        AttendanceError::validation_with("date must be YYYY-MM-DD", json!({ "date": raw }))
    })
}

pub fn parse_time(raw: &str) -> AttendanceResult<NaiveTime> {
    let t = raw.trim();
    NaiveTime::parse_from_str(t, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
        .map_err(|_| AttendanceError::validation_with("time must be HH:MM[:SS]", json!({ "time": raw })))
}

pub(crate) fn required_str(params: &serde_json::Value, key: &str) -> AttendanceResult<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| AttendanceError::validation(format!("missing {}", key)))
}

fn required_id(params: &serde_json::Value, key: &str) -> AttendanceResult<String> {
    let v = required_str(params, key)?;
    let t = v.trim();
    if t.is_empty() {
        return Err(AttendanceError::validation(format!("{} must not be empty", key)));
    }
    Ok(t.to_string())
}

fn optional_id(params: &serde_json::Value, key: &str) -> AttendanceResult<Option<String>> {
    Ok(optional_str(params, key)?
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

pub(crate) fn optional_str(params: &serde_json::Value, key: &str) -> AttendanceResult<Option<String>> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| AttendanceError::validation(format!("{} must be string or null", key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_from_json_validates_fields() {
        let d = RecordDraft::from_json(&json!({
            "entityId": " s1 ",
            "classId": "c1",
            "date": "2024-01-15",
            "status": "late",
            "remarks": "  traffic  ",
            "arrivalTime": "08:10"
        }))
        .expect("draft");
        assert_eq!(d.entity_id, "s1");
        assert_eq!(d.class_id.as_deref(), Some("c1"));
        assert_eq!(d.status, AttendanceStatus::Late);
        assert_eq!(d.remarks.as_deref(), Some("traffic"));
        assert_eq!(d.arrival_time, NaiveTime::from_hms_opt(8, 10, 0));
        assert_eq!(d.departure_time, None);
    }

    #[test]
    fn draft_from_json_rejects_bad_input() {
        let bad_date = RecordDraft::from_json(&json!({
            "entityId": "s1", "date": "15/01/2024", "status": "PRESENT"
        }));
        assert_eq!(bad_date.unwrap_err().code(), "bad_params");

        let bad_status = RecordDraft::from_json(&json!({
            "entityId": "s1", "date": "2024-01-15", "status": "UNMARKED"
        }));
        assert_eq!(bad_status.unwrap_err().code(), "bad_params");

        let backwards = RecordDraft::from_json(&json!({
            "entityId": "s1", "date": "2024-01-15", "status": "PRESENT",
            "arrivalTime": "10:00", "departureTime": "09:00"
        }));
        assert!(backwards.is_err());

        let empty_entity = RecordDraft::from_json(&json!({
            "entityId": "  ", "date": "2024-01-15", "status": "PRESENT"
        }));
        assert!(empty_entity.is_err());
    }

    #[test]
    fn blank_class_id_means_no_session() {
        let d = RecordDraft::from_json(&json!({
            "entityId": "s1", "classId": "", "date": "2024-01-15", "status": "ABSENT"
        }))
        .expect("draft");
        assert_eq!(d.class_id, None);
    }
}
