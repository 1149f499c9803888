use super::error::{AttendanceError, AttendanceResult};
use super::record::{parse_date, AttendanceRecord};
use super::status::AttendanceStatus;
use chrono::NaiveDate;
use serde_json::json;
use std::collections::HashMap;

/// How a filter picks out entities. Ids are opaque and compared exactly;
/// names are human-readable and matched as case-insensitive substrings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityMatch {
    Id(String),
    NameContains(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub entity: Option<EntityMatch>,
    pub class_id: Option<String>,
    pub status: Option<AttendanceStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl RecordFilter {
    pub fn for_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity: Some(EntityMatch::Id(entity_id.into())),
            ..Self::default()
        }
    }

    pub fn for_class_date(class_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            class_id: Some(class_id.into()),
            date_from: Some(date),
            date_to: Some(date),
            ..Self::default()
        }
    }

    pub fn entity_id(&self) -> Option<&str> {
        match &self.entity {
            Some(EntityMatch::Id(id)) => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn name_needle(&self) -> Option<&str> {
        match &self.entity {
            Some(EntityMatch::NameContains(n)) => Some(n.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrder {
    DateAsc,
    DateDesc,
    EntityThenDate,
}

impl RecordOrder {
    pub fn parse(raw: &str) -> AttendanceResult<Self> {
        match raw.trim() {
            "dateAsc" => Ok(RecordOrder::DateAsc),
            "dateDesc" => Ok(RecordOrder::DateDesc),
            "entityThenDate" => Ok(RecordOrder::EntityThenDate),
            other => Err(AttendanceError::validation_with(
                "sort must be one of: dateAsc, dateDesc, entityThenDate",
                json!({ "sort": other }),
            )),
        }
    }
}

fn matches(
    r: &AttendanceRecord,
    filter: &RecordFilter,
    names: Option<&HashMap<String, String>>,
) -> bool {
    match &filter.entity {
        None => {}
        Some(EntityMatch::Id(id)) => {
            if r.entity_id != *id {
                return false;
            }
        }
        Some(EntityMatch::NameContains(needle)) => {
            let name = names.and_then(|m| m.get(&r.entity_id));
            let Some(name) = name else {
                return false;
            };
            if !name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
    }
    if let Some(class_id) = &filter.class_id {
        if r.class_id.as_deref() != Some(class_id.as_str()) {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if r.status != status {
            return false;
        }
    }
    if let Some(from) = filter.date_from {
        if r.date < from {
            return false;
        }
    }
    if let Some(to) = filter.date_to {
        if r.date > to {
            return false;
        }
    }
    true
}

/// Records matching `filter`, in input order.
///
/// `names` maps entity id to display name and is required for
/// [`EntityMatch::NameContains`].
pub fn select(
    records: &[AttendanceRecord],
    filter: &RecordFilter,
    names: Option<&HashMap<String, String>>,
) -> AttendanceResult<Vec<AttendanceRecord>> {
    if filter.name_needle().is_some() && names.is_none() {
        return Err(AttendanceError::validation(
            "name matching needs a display-name lookup",
        ));
    }
    Ok(records
        .iter()
        .filter(|r| matches(r, filter, names))
        .cloned()
        .collect())
}

pub fn sort_records(records: &mut [AttendanceRecord], order: RecordOrder) {
    match order {
        RecordOrder::DateAsc => records.sort_by(|a, b| a.date.cmp(&b.date)),
        RecordOrder::DateDesc => records.sort_by(|a, b| b.date.cmp(&a.date)),
        RecordOrder::EntityThenDate => records.sort_by(|a, b| {
            a.entity_id
                .cmp(&b.entity_id)
                .then_with(|| a.date.cmp(&b.date))
        }),
    }
}

fn optional_filter_str(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> AttendanceResult<Option<String>> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(AttendanceError::validation(format!(
                    "filters.{} must be string or null",
                    key
                )));
            };
            let t = s.trim();
            if t.is_empty() || t.eq_ignore_ascii_case("ALL") {
                Ok(None)
            } else {
                Ok(Some(t.to_string()))
            }
        }
    }
}

pub fn parse_record_filter(raw: Option<&serde_json::Value>) -> AttendanceResult<RecordFilter> {
    let Some(raw) = raw else {
        return Ok(RecordFilter::default());
    };
    if raw.is_null() {
        return Ok(RecordFilter::default());
    }
    let Some(obj) = raw.as_object() else {
        return Err(AttendanceError::validation("filters must be an object"));
    };

    let entity_id = optional_filter_str(obj, "entityId")?;
    let entity_name = optional_filter_str(obj, "entityName")?;
    let entity = match (entity_id, entity_name) {
        (Some(_), Some(_)) => {
            return Err(AttendanceError::validation(
                "filters.entityId and filters.entityName are mutually exclusive",
            ))
        }
        (Some(id), None) => Some(EntityMatch::Id(id)),
        (None, Some(name)) => Some(EntityMatch::NameContains(name)),
        (None, None) => None,
    };

    let class_id = optional_filter_str(obj, "classId")?;
    let status = optional_filter_str(obj, "status")?
        .map(|s| AttendanceStatus::parse(&s))
        .transpose()?;

    let exact = optional_filter_str(obj, "date")?
        .map(|s| parse_date(&s))
        .transpose()?;
    let mut date_from = optional_filter_str(obj, "dateFrom")?
        .map(|s| parse_date(&s))
        .transpose()?;
    let mut date_to = optional_filter_str(obj, "dateTo")?
        .map(|s| parse_date(&s))
        .transpose()?;
    if let Some(d) = exact {
        if date_from.is_some() || date_to.is_some() {
            return Err(AttendanceError::validation(
                "filters.date cannot be combined with dateFrom/dateTo",
            ));
        }
        date_from = Some(d);
        date_to = Some(d);
    }
    if let (Some(from), Some(to)) = (date_from, date_to) {
        if from > to {
            return Err(AttendanceError::validation_with(
                "filters.dateFrom must not be after filters.dateTo",
                json!({ "dateFrom": from.to_string(), "dateTo": to.to_string() }),
            ));
        }
    }

    Ok(RecordFilter {
        entity,
        class_id,
        status,
        date_from,
        date_to,
    })
}
