use super::error::{AttendanceError, AttendanceResult};
use super::filter::RecordFilter;
use super::record::{parse_date, required_str, AttendanceRecord, RecordDraft};
use super::status::AttendanceStatus;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

pub const BULK_MAX_ENTITIES: usize = 5000;

/// Persistence collaborator. Implementations serialize conflicting upserts
/// for the same (entity, class, date) key; the last write wins.
pub trait AttendanceStore {
    fn get_records(&self, filter: &RecordFilter) -> AttendanceResult<Vec<AttendanceRecord>>;

    /// Inserts, or updates the record already stored under the draft's key.
    fn upsert_record(&self, draft: &RecordDraft) -> AttendanceResult<AttendanceRecord>;

    fn session_exists(&self, class_id: &str, date: NaiveDate) -> AttendanceResult<bool>;

    fn entity_enrolled(&self, entity_id: &str, class_id: &str) -> AttendanceResult<bool>;
}

/// Cooperative stop signal for [`apply_bulk`]. The daemon handles one
/// request at a time and never raises it; embedders driving `apply_bulk`
/// from a worker thread can.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    #[cfg(test)]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkRequest {
    pub entity_ids: Vec<String>,
    pub class_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub remarks_by_entity: HashMap<String, String>,
    pub require_session: bool,
}

impl BulkRequest {
    pub fn new(
        entity_ids: Vec<String>,
        class_id: impl Into<String>,
        date: NaiveDate,
        status: AttendanceStatus,
    ) -> Self {
        Self {
            entity_ids,
            class_id: class_id.into(),
            date,
            status,
            remarks_by_entity: HashMap::new(),
            require_session: true,
        }
    }

    pub fn from_json(params: &serde_json::Value) -> AttendanceResult<Self> {
        let Some(ids_json) = params.get("entityIds").and_then(|v| v.as_array()) else {
            return Err(AttendanceError::validation("missing entityIds"));
        };
        let mut entity_ids = Vec::with_capacity(ids_json.len());
        for (i, v) in ids_json.iter().enumerate() {
            let Some(s) = v.as_str() else {
                return Err(AttendanceError::validation_with(
                    "entityIds must be strings",
                    json!({ "index": i }),
                ));
            };
            entity_ids.push(s.trim().to_string());
        }
        let class_id = params
            .get("classId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let date = parse_date(&required_str(params, "date")?)?;
        let status = AttendanceStatus::parse(&required_str(params, "status")?)?;

        let mut remarks_by_entity = HashMap::new();
        match params.get("remarksByEntity") {
            None => {}
            Some(v) if v.is_null() => {}
            Some(v) => {
                let Some(obj) = v.as_object() else {
                    return Err(AttendanceError::validation(
                        "remarksByEntity must be an object",
                    ));
                };
                for (k, v) in obj {
                    let Some(s) = v.as_str() else {
                        return Err(AttendanceError::validation_with(
                            "remarksByEntity values must be strings",
                            json!({ "entityId": k }),
                        ));
                    };
                    remarks_by_entity.insert(k.clone(), s.to_string());
                }
            }
        }
        let require_session = match params.get("requireSession") {
            None => true,
            Some(v) if v.is_null() => true,
            Some(v) => v
                .as_bool()
                .ok_or_else(|| AttendanceError::validation("requireSession must be a boolean"))?,
        };

        let mut req = Self::new(entity_ids, class_id, date, status);
        req.remarks_by_entity = remarks_by_entity;
        req.require_session = require_session;
        Ok(req)
    }

    /// Entity ids with blanks dropped and repeats collapsed, first occurrence kept.
    pub fn unique_entity_ids(&self) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::with_capacity(self.entity_ids.len());
        for id in &self.entity_ids {
            if !id.is_empty() && seen.insert(id.as_str()) {
                out.push(id.clone());
            }
        }
        out
    }

    fn validate(&self) -> AttendanceResult<Vec<String>> {
        if self.class_id.is_empty() {
            return Err(AttendanceError::validation("missing classId"));
        }
        let ids = self.unique_entity_ids();
        if ids.is_empty() {
            return Err(AttendanceError::validation("entityIds must not be empty"));
        }
        if ids.len() > BULK_MAX_ENTITIES {
            return Err(AttendanceError::validation_with(
                "too many entities in one batch",
                json!({ "count": ids.len(), "max": BULK_MAX_ENTITIES }),
            ));
        }
        let id_set: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut stray: Vec<&str> = self
            .remarks_by_entity
            .keys()
            .map(String::as_str)
            .filter(|k| !id_set.contains(k))
            .collect();
        if !stray.is_empty() {
            stray.sort_unstable();
            return Err(AttendanceError::validation_with(
                "remarksByEntity names entities outside the batch",
                json!({ "entityIds": stray }),
            ));
        }
        Ok(ids)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    pub entity_id: String,
    pub code: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOutcome {
    Complete,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<BulkFailure>,
    pub records: Vec<AttendanceRecord>,
}

impl BulkResult {
    pub fn outcome(&self) -> BulkOutcome {
        match (self.succeeded.is_empty(), self.failed.is_empty()) {
            (_, true) => BulkOutcome::Complete,
            (false, false) => BulkOutcome::Partial,
            (true, false) => BulkOutcome::Failed,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.outcome() == BulkOutcome::Partial
    }

    /// Ids worth offering for retry. Validation and enrollment rejections
    /// would fail again unchanged, so they are left out.
    pub fn retryable_ids(&self) -> Vec<String> {
        self.failed
            .iter()
            .filter(|f| f.code != "bad_params" && f.code != "not_found")
            .map(|f| f.entity_id.clone())
            .collect()
    }
}

fn failure(entity_id: &str, e: &AttendanceError) -> BulkFailure {
    BulkFailure {
        entity_id: entity_id.to_string(),
        code: e.code().to_string(),
        reason: e.to_string(),
    }
}

/// Marks every entity in `req` with one status for one class session.
///
/// Request-level problems (bad input, no session that day) fail the call
/// before anything is written. After that each entity is written on its own:
/// a failed write lands in `failed` and the batch carries on. Raising
/// `cancel` stops further writes; entities not yet reached are reported as
/// `cancelled`.
pub fn apply_bulk<S: AttendanceStore + ?Sized>(
    store: &S,
    req: &BulkRequest,
    cancel: Option<&CancelFlag>,
) -> AttendanceResult<BulkResult> {
    let entity_ids = req.validate()?;

    if req.require_session && !store.session_exists(&req.class_id, req.date)? {
        return Err(AttendanceError::not_found_with(
            "no class session scheduled for this date",
            json!({ "classId": req.class_id, "date": req.date.to_string() }),
        ));
    }

    let mut result = BulkResult {
        succeeded: Vec::with_capacity(entity_ids.len()),
        failed: Vec::new(),
        records: Vec::with_capacity(entity_ids.len()),
    };

    for entity_id in &entity_ids {
        if cancel.map(CancelFlag::is_cancelled).unwrap_or(false) {
            result.failed.push(BulkFailure {
                entity_id: entity_id.clone(),
                code: "cancelled".to_string(),
                reason: "batch cancelled before this write was issued".to_string(),
            });
            continue;
        }

        match store.entity_enrolled(entity_id, &req.class_id) {
            Ok(true) => {}
            Ok(false) => {
                let e = AttendanceError::not_found("entity is not enrolled in this class");
                result.failed.push(failure(entity_id, &e));
                continue;
            }
            Err(e) => {
                result.failed.push(failure(entity_id, &e));
                continue;
            }
        }

        let draft = RecordDraft::new(
            entity_id.clone(),
            Some(req.class_id.clone()),
            req.date,
            req.status,
        )
        .with_remarks(req.remarks_by_entity.get(entity_id).map(String::as_str));

        match store.upsert_record(&draft) {
            Ok(record) => {
                result.succeeded.push(entity_id.clone());
                result.records.push(record);
            }
            Err(e) => {
                tracing::warn!(
                    entity_id = %entity_id,
                    class_id = %req.class_id,
                    date = %req.date,
                    code = e.code(),
                    error = %e,
                    "attendance upsert failed"
                );
                result.failed.push(failure(entity_id, &e));
            }
        }
    }

    tracing::info!(
        class_id = %req.class_id,
        date = %req.date,
        status = %req.status,
        succeeded = result.succeeded.len(),
        failed = result.failed.len(),
        "bulk attendance applied"
    );
    Ok(result)
}
