use crate::attendance::aggregate::{roster_average, summarize, summarize_for_entities, AttendanceSummary};
use crate::attendance::bulk::{apply_bulk, AttendanceStore, BulkRequest};
use crate::attendance::filter::{parse_record_filter, sort_records, RecordFilter, RecordOrder};
use crate::attendance::notify::{compute_notify_targets, dispatch, NotifyMode};
use crate::attendance::record::{normalize_remarks, parse_date, RecordDraft, RecordKey};
use crate::attendance::status::{AttendanceStatus, PresencePolicy, RosterMark};
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_optional_bool, get_optional_str, get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::{load_policy, save_policy, OutboxNotifier, SqliteStore};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use std::collections::{HashMap, HashSet};

fn date_range(params: &serde_json::Value) -> Result<(Option<NaiveDate>, Option<NaiveDate>), HandlerErr> {
    let f = parse_record_filter(Some(&json!({
        "dateFrom": params.get("dateFrom"),
        "dateTo": params.get("dateTo"),
    })))?;
    Ok((f.date_from, f.date_to))
}

fn summary_json(s: &AttendanceSummary, display_name: &str) -> serde_json::Value {
    let mut v = json!(s);
    v["displayName"] = json!(display_name);
    v
}

fn attendance_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let filter = parse_record_filter(params.get("filters"))?;
    let store = SqliteStore::new(conn);
    let mut records = store.get_records(&filter)?;
    if let Some(sort) = get_optional_str(params, "sort")? {
        sort_records(&mut records, RecordOrder::parse(&sort)?);
    }
    Ok(json!({ "count": records.len(), "records": records }))
}

fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let draft = RecordDraft::from_json(params)?;
    let require_session = get_optional_bool(params, "requireSession", true)?;
    let store = SqliteStore::new(conn);

    if !store.student_exists(&draft.entity_id)? {
        return Err(HandlerErr::new("not_found", "student not found")
            .with_details(json!({ "entityId": draft.entity_id })));
    }
    if let Some(class_id) = draft.class_id.as_deref() {
        if !store.class_exists(class_id)? {
            return Err(HandlerErr::new("not_found", "class not found"));
        }
        if !store.entity_enrolled(&draft.entity_id, class_id)? {
            return Err(HandlerErr::new("not_found", "student is not enrolled in this class"));
        }
        if require_session && !store.session_exists(class_id, draft.date)? {
            return Err(HandlerErr::new("not_found", "no class session scheduled for this date")
                .with_details(json!({ "classId": class_id, "date": draft.date.to_string() })));
        }
    }

    let record = store.upsert_record(&draft)?;
    tracing::info!(
        entity_id = %record.entity_id,
        date = %record.date,
        status = %record.status,
        "attendance marked"
    );
    Ok(json!({ "record": record }))
}

fn attendance_set_remarks(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = RecordKey {
        entity_id: get_required_str(params, "entityId")?,
        class_id: get_optional_str(params, "classId")?,
        date: parse_date(&get_required_str(params, "date")?)?,
    };
    let remarks = match params.get("remarks") {
        None => return Err(HandlerErr::bad_params("missing remarks")),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => normalize_remarks(Some(s)),
            None => return Err(HandlerErr::bad_params("remarks must be string or null")),
        },
    };
    let record = SqliteStore::new(conn).set_remarks(&key, remarks.as_deref())?;
    Ok(json!({ "record": record }))
}

/// Per-entity summaries within one class, used for before/after comparison.
fn class_summaries(
    store: &SqliteStore<'_>,
    class_id: &str,
    entity_ids: &[String],
    policy: &PresencePolicy,
) -> Result<Vec<AttendanceSummary>, HandlerErr> {
    let wanted: HashSet<&str> = entity_ids.iter().map(String::as_str).collect();
    let records: Vec<_> = store
        .get_records(&RecordFilter {
            class_id: Some(class_id.to_string()),
            ..RecordFilter::default()
        })?
        .into_iter()
        .filter(|r| wanted.contains(r.entity_id.as_str()))
        .collect();
    Ok(summarize_for_entities(entity_ids, &records, policy)?)
}

fn attendance_bulk_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let bulk = BulkRequest::from_json(params)?;
    let notify = get_optional_bool(params, "notify", false)?;
    let policy = load_policy(conn)?;
    let store = SqliteStore::new(conn);

    let entity_ids = bulk.unique_entity_ids();
    let before = class_summaries(&store, &bulk.class_id, &entity_ids, &policy)?;
    let result = apply_bulk(&store, &bulk, None)?;
    if result.is_partial() {
        tracing::warn!(
            class_id = %bulk.class_id,
            date = %bulk.date,
            failed = result.failed.len(),
            "bulk attendance partially applied"
        );
    }
    let after = class_summaries(&store, &bulk.class_id, &result.succeeded, &policy)?;
    let targets = compute_notify_targets(&before, &after, &policy, NotifyMode::Transition);

    let dispatched = if notify && !targets.is_empty() {
        Some(dispatch(&OutboxNotifier::new(conn), &targets))
    } else {
        None
    };

    Ok(json!({
        "outcome": result.outcome(),
        "succeeded": result.succeeded,
        "failed": result.failed,
        "retryable": result.retryable_ids(),
        "records": result.records,
        "notifyTargets": targets,
        "notifications": dispatched
    }))
}

fn attendance_day_sheet(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?)?;
    let store = SqliteStore::new(conn);
    if !store.class_exists(&class_id)? {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let roster = store.class_roster(&class_id)?;
    let records = store.get_records(&RecordFilter::for_class_date(class_id.clone(), date))?;
    let by_entity: HashMap<&str, _> = records.iter().map(|r| (r.entity_id.as_str(), r)).collect();

    let mut counts: HashMap<&'static str, u32> = HashMap::new();
    let rows: Vec<serde_json::Value> = roster
        .iter()
        .map(|(id, name)| {
            let rec = by_entity.get(id.as_str());
            let mark = RosterMark::from(rec.map(|r| r.status));
            *counts.entry(mark.as_str()).or_insert(0) += 1;
            json!({
                "studentId": id,
                "displayName": name,
                "status": mark,
                "remarks": rec.and_then(|r| r.remarks.clone()),
                "arrivalTime": rec.and_then(|r| r.arrival_time),
                "departureTime": rec.and_then(|r| r.departure_time)
            })
        })
        .collect();

    let mut counts_json = json!({ "UNMARKED": counts.get("UNMARKED").copied().unwrap_or(0) });
    for s in AttendanceStatus::ALL {
        counts_json[s.as_str()] = json!(counts.get(s.as_str()).copied().unwrap_or(0));
    }

    Ok(json!({
        "classId": class_id,
        "date": date.to_string(),
        "sessionScheduled": store.session_exists(&class_id, date)?,
        "rows": rows,
        "counts": counts_json
    }))
}

fn attendance_summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let entity_id = get_required_str(params, "entityId")?;
    let class_id = get_optional_str(params, "classId")?;
    let (date_from, date_to) = date_range(params)?;
    let policy = load_policy(conn)?;
    let store = SqliteStore::new(conn);
    if !store.student_exists(&entity_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let mut filter = RecordFilter::for_entity(entity_id.clone());
    filter.class_id = class_id;
    filter.date_from = date_from;
    filter.date_to = date_to;
    let records = store.get_records(&filter)?;
    let summary = summarize(&entity_id, &records, &policy)?;
    Ok(json!({ "summary": summary, "policy": policy }))
}

fn attendance_roster(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let (date_from, date_to) = date_range(params)?;
    let policy = load_policy(conn)?;
    let store = SqliteStore::new(conn);
    if !store.class_exists(&class_id)? {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let roster = store.class_roster(&class_id)?;
    let ids: Vec<String> = roster.iter().map(|(id, _)| id.clone()).collect();
    let records = store.get_records(&RecordFilter {
        class_id: Some(class_id.clone()),
        date_from,
        date_to,
        ..RecordFilter::default()
    })?;
    let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let records: Vec<_> = records
        .into_iter()
        .filter(|r| wanted.contains(r.entity_id.as_str()))
        .collect();
    let summaries = summarize_for_entities(&ids, &records, &policy)?;
    let students: Vec<serde_json::Value> = summaries
        .iter()
        .zip(roster.iter())
        .map(|(s, (_, name))| summary_json(s, name))
        .collect();

    Ok(json!({
        "classId": class_id,
        "students": students,
        "classAverage": roster_average(&summaries)
    }))
}

fn attendance_family(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let guardian_id = get_required_str(params, "guardianId")?;
    let (date_from, date_to) = date_range(params)?;
    let policy = load_policy(conn)?;
    let store = SqliteStore::new(conn);
    if !store.guardian_exists(&guardian_id)? {
        return Err(HandlerErr::new("not_found", "guardian not found")
            .with_details(json!({ "guardianId": guardian_id })));
    }

    let children = store.guardian_children(&guardian_id)?;
    let mut summaries = Vec::with_capacity(children.len());
    for (id, _) in &children {
        let mut filter = RecordFilter::for_entity(id.clone());
        filter.date_from = date_from;
        filter.date_to = date_to;
        let records = store.get_records(&filter)?;
        summaries.push(summarize(id, &records, &policy)?);
    }
    let rows: Vec<serde_json::Value> = summaries
        .iter()
        .zip(children.iter())
        .map(|(s, (_, name))| summary_json(s, name))
        .collect();

    Ok(json!({
        "guardianId": guardian_id,
        "children": rows,
        "familyAverage": roster_average(&summaries)
    }))
}

fn parse_summaries(params: &serde_json::Value, key: &str) -> Result<Vec<AttendanceSummary>, HandlerErr> {
    match params.get(key) {
        None => Ok(Vec::new()),
        Some(v) if v.is_null() => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            HandlerErr::bad_params(format!("{} must be a list of summaries", key))
                .with_details(json!({ "error": e.to_string() }))
        }),
    }
}

fn handle_attendance_notify_targets(state: &mut AppState, req: &Request) -> serde_json::Value {
    let run = || -> Result<serde_json::Value, HandlerErr> {
        let before = parse_summaries(&req.params, "before")?;
        let after = parse_summaries(&req.params, "after")?;
        let mode = NotifyMode::parse(req.params.get("mode").and_then(|v| v.as_str()))?;
        let policy = match state.db.as_ref() {
            Some(conn) => load_policy(conn)?,
            None => PresencePolicy::default(),
        };
        let targets = compute_notify_targets(&before, &after, &policy, mode);
        Ok(json!({ "count": targets.len(), "targets": targets }))
    };
    match run() {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn attendance_policy_get(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "policy": load_policy(conn)? }))
}

fn attendance_policy_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut policy = load_policy(conn)?;
    if let Some(v) = params.get("excusedWeight") {
        policy.excused_weight = v
            .as_f64()
            .ok_or_else(|| HandlerErr::bad_params("excusedWeight must be a number"))?;
    }
    if let Some(v) = params.get("streakMaxGapDays") {
        policy.streak_max_gap_days = v
            .as_i64()
            .ok_or_else(|| HandlerErr::bad_params("streakMaxGapDays must be an integer"))?;
    }
    if let Some(v) = params.get("lowRateThreshold") {
        policy.low_rate_threshold = v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| HandlerErr::bad_params("lowRateThreshold must be a non-negative integer"))?;
    }
    save_policy(conn, &policy)?;
    tracing::info!(
        excused_weight = policy.excused_weight,
        streak_max_gap_days = policy.streak_max_gap_days,
        low_rate_threshold = policy.low_rate_threshold,
        "attendance policy updated"
    );
    Ok(json!({ "policy": policy }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.get" => Some(with_db(state, req, attendance_get)),
        "attendance.mark" => Some(with_db(state, req, attendance_mark)),
        "attendance.setRemarks" => Some(with_db(state, req, attendance_set_remarks)),
        "attendance.bulkMark" => Some(with_db(state, req, attendance_bulk_mark)),
        "attendance.daySheet" => Some(with_db(state, req, attendance_day_sheet)),
        "attendance.summary" => Some(with_db(state, req, attendance_summary)),
        "attendance.roster" => Some(with_db(state, req, attendance_roster)),
        "attendance.family" => Some(with_db(state, req, attendance_family)),
        "attendance.notifyTargets" => Some(handle_attendance_notify_targets(state, req)),
        "attendance.policy.get" => Some(with_db(state, req, attendance_policy_get)),
        "attendance.policy.update" => Some(with_db(state, req, attendance_policy_update)),
        _ => None,
    }
}
