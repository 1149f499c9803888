use super::error::{AttendanceError, AttendanceResult};
use super::record::AttendanceRecord;
use super::status::{AttendanceStatus, PresencePolicy};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Derived per-entity statistics. Never stored; recomputed on every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub entity_id: String,
    #[serde(default)]
    pub total_classes: u32,
    #[serde(default)]
    pub present: u32,
    #[serde(default)]
    pub absent: u32,
    #[serde(default)]
    pub late: u32,
    #[serde(default)]
    pub excused: u32,
    #[serde(default)]
    pub attendance_rate: u32,
    #[serde(default)]
    pub streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_date: Option<NaiveDate>,
}

impl AttendanceSummary {
    pub fn empty(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            total_classes: 0,
            present: 0,
            absent: 0,
            late: 0,
            excused: 0,
            attendance_rate: 0,
            streak: 0,
            last_date: None,
        }
    }
}

/// `round(100 * weighted / total)`, 0 when there is nothing to divide by.
pub fn attendance_rate(weighted_present: f64, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let pct = (100.0 * weighted_present / f64::from(total)).round();
    pct.clamp(0.0, 100.0) as u32
}

/// One decimal, half-up.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub fn summarize(
    entity_id: &str,
    records: &[AttendanceRecord],
    policy: &PresencePolicy,
) -> AttendanceResult<AttendanceSummary> {
    let refs: Vec<&AttendanceRecord> = records.iter().collect();
    summarize_refs(entity_id, &refs, policy)
}

fn summarize_refs(
    entity_id: &str,
    records: &[&AttendanceRecord],
    policy: &PresencePolicy,
) -> AttendanceResult<AttendanceSummary> {
    let mut summary = AttendanceSummary::empty(entity_id);
    if records.is_empty() {
        return Ok(summary);
    }

    let mut seen: HashSet<(Option<&str>, NaiveDate)> = HashSet::with_capacity(records.len());
    let mut weighted = 0.0_f64;
    for r in records {
        if r.entity_id != entity_id {
            return Err(AttendanceError::validation_with(
                "record belongs to a different entity",
                json!({ "expected": entity_id, "found": r.entity_id, "recordId": r.id }),
            ));
        }
        if !seen.insert((r.class_id.as_deref(), r.date)) {
            return Err(AttendanceError::DuplicateRecord {
                entity_id: r.entity_id.clone(),
                class_id: r.class_id.clone(),
                date: r.date.to_string(),
            });
        }
        match r.status {
            AttendanceStatus::Present => summary.present += 1,
            AttendanceStatus::Absent => summary.absent += 1,
            AttendanceStatus::Late => summary.late += 1,
            AttendanceStatus::Excused => summary.excused += 1,
        }
        weighted += policy.presence_weight(r.status);
    }

    summary.total_classes = records.len() as u32;
    summary.attendance_rate = attendance_rate(weighted, summary.total_classes);
    summary.streak = presence_streak(records, policy);
    summary.last_date = records.iter().map(|r| r.date).max();
    Ok(summary)
}

/// Consecutive qualifying dates counted back from the newest one.
///
/// A date qualifies when every record on it counts toward presence (an
/// entity can sit in more than one class a day). The walk stops at the
/// first non-qualifying date or at a gap wider than the class cadence.
fn presence_streak(records: &[&AttendanceRecord], policy: &PresencePolicy) -> u32 {
    let mut by_date: BTreeMap<NaiveDate, bool> = BTreeMap::new();
    for r in records {
        let q = policy.counts_toward_presence(r.status);
        by_date
            .entry(r.date)
            .and_modify(|all| *all = *all && q)
            .or_insert(q);
    }

    let mut streak = 0;
    let mut newer: Option<NaiveDate> = None;
    for (date, qualifies) in by_date.iter().rev() {
        if !qualifies {
            break;
        }
        if let Some(n) = newer {
            if (n - *date).num_days() > policy.streak_max_gap_days {
                break;
            }
        }
        streak += 1;
        newer = Some(*date);
    }
    streak
}

/// Summaries for every entity present in `records`, in first-appearance order.
pub fn summarize_by_entity(
    records: &[AttendanceRecord],
    policy: &PresencePolicy,
) -> AttendanceResult<Vec<AttendanceSummary>> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&AttendanceRecord>> = HashMap::new();
    for r in records {
        let entry = groups.entry(r.entity_id.as_str()).or_insert_with(|| {
            order.push(r.entity_id.as_str());
            Vec::new()
        });
        entry.push(r);
    }

    let mut out = Vec::with_capacity(order.len());
    for entity_id in order {
        let group = groups.get(entity_id).map(Vec::as_slice).unwrap_or(&[]);
        out.push(summarize_refs(entity_id, group, policy)?);
    }
    Ok(out)
}

/// Like [`summarize_by_entity`] but yields one summary per requested entity,
/// including empty ones for entities without records.
pub fn summarize_for_entities(
    entity_ids: &[String],
    records: &[AttendanceRecord],
    policy: &PresencePolicy,
) -> AttendanceResult<Vec<AttendanceSummary>> {
    let computed = summarize_by_entity(records, policy)?;
    let mut by_id: HashMap<String, AttendanceSummary> = computed
        .into_iter()
        .map(|s| (s.entity_id.clone(), s))
        .collect();
    Ok(entity_ids
        .iter()
        .map(|id| by_id.remove(id).unwrap_or_else(|| AttendanceSummary::empty(id.clone())))
        .collect())
}

/// Arithmetic mean of per-entity rates (class average, family average).
///
/// Rates are averaged as-is rather than pooled from raw counts, so an entity
/// with two records weighs the same as one with two hundred.
pub fn roster_average(summaries: &[AttendanceSummary]) -> f64 {
    if summaries.is_empty() {
        return 0.0;
    }
    let sum: f64 = summaries.iter().map(|s| f64::from(s.attendance_rate)).sum();
    round_off_1_decimal(sum / summaries.len() as f64)
}
