use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttendanceError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("duplicate attendance record for {entity_id} on {date}")]
    DuplicateRecord {
        entity_id: String,
        class_id: Option<String>,
        date: String,
    },

    #[error("{message}")]
    NotFound {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("{message}")]
    Persistence {
        code: &'static str,
        message: String,
    },
}

impl AttendanceError {
    pub fn validation(message: impl Into<String>) -> Self {
        AttendanceError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        AttendanceError::Validation {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AttendanceError::NotFound {
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        AttendanceError::NotFound {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn query_failed(e: impl std::fmt::Display) -> Self {
        AttendanceError::Persistence {
            code: "db_query_failed",
            message: e.to_string(),
        }
    }

    pub fn update_failed(e: impl std::fmt::Display) -> Self {
        AttendanceError::Persistence {
            code: "db_update_failed",
            message: e.to_string(),
        }
    }

    /// Stable wire code, shared with the IPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AttendanceError::Validation { .. } => "bad_params",
            AttendanceError::DuplicateRecord { .. } => "duplicate_record",
            AttendanceError::NotFound { .. } => "not_found",
            AttendanceError::Persistence { code, .. } => *code,
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            AttendanceError::Validation { details, .. } => details.clone(),
            AttendanceError::NotFound { details, .. } => details.clone(),
            AttendanceError::DuplicateRecord {
                entity_id,
                class_id,
                date,
            } => Some(json!({
                "entityId": entity_id,
                "classId": class_id,
                "date": date
            })),
            AttendanceError::Persistence { .. } => None,
        }
    }
}

pub type AttendanceResult<T> = Result<T, AttendanceError>;
