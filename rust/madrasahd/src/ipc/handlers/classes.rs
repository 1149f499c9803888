use crate::attendance::record::{parse_date, parse_time};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, get_string_list, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           (SELECT COUNT(*) FROM enrollments e WHERE e.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM class_sessions cs WHERE cs.class_id = c.id) AS session_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let student_count: i64 = row.get(2)?;
            let session_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "studentCount": student_count,
                "sessionCount": session_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name) VALUES(?, ?)",
        (&class_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn classes_enroll(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_ids = get_string_list(params, "studentIds")?;
    let store = SqliteStore::new(conn);
    if !store.class_exists(&class_id)? {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut next_order: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM enrollments WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    )?;
    let mut enrolled = 0usize;
    let mut missing: Vec<String> = Vec::new();
    for student_id in student_ids {
        if !SqliteStore::new(&tx).student_exists(&student_id)? {
            missing.push(student_id);
            continue;
        }
        let changed = tx
            .execute(
                "INSERT INTO enrollments(class_id, student_id, sort_order)
                 VALUES(?, ?, ?)
                 ON CONFLICT(class_id, student_id) DO NOTHING",
                (&class_id, &student_id, next_order),
            )
            .map_err(|e| {
                HandlerErr::new("db_insert_failed", e.to_string())
                    .with_details(json!({ "table": "enrollments" }))
            })?;
        if changed > 0 {
            next_order += 1;
            enrolled += 1;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "enrolled": enrolled, "missing": missing }))
}

fn sessions_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?)?;
    let start_time = get_optional_str(params, "startTime")?
        .map(|s| parse_time(&s))
        .transpose()?;
    let end_time = get_optional_str(params, "endTime")?
        .map(|s| parse_time(&s))
        .transpose()?;
    if !SqliteStore::new(conn).class_exists(&class_id)? {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM class_sessions WHERE class_id = ? AND date = ?",
            (&class_id, date.to_string()),
            |r| r.get(0),
        )
        .optional()?;
    let session_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());
    conn.execute(
        "INSERT INTO class_sessions(id, class_id, date, start_time, end_time)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(class_id, date) DO UPDATE SET
           start_time = excluded.start_time,
           end_time = excluded.end_time",
        (
            &session_id,
            &class_id,
            date.to_string(),
            start_time.map(|t| t.format("%H:%M").to_string()),
            end_time.map(|t| t.format("%H:%M").to_string()),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "class_sessions" }))
    })?;

    Ok(json!({ "sessionId": session_id, "classId": class_id, "date": date.to_string() }))
}

fn sessions_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date_from = get_optional_str(params, "dateFrom")?
        .map(|s| parse_date(&s))
        .transpose()?
        .map(|d| d.to_string())
        .unwrap_or_else(|| "0000-01-01".to_string());
    let date_to = get_optional_str(params, "dateTo")?
        .map(|s| parse_date(&s))
        .transpose()?
        .map(|d| d.to_string())
        .unwrap_or_else(|| "9999-12-31".to_string());

    let mut stmt = conn.prepare(
        "SELECT id, date, start_time, end_time
         FROM class_sessions
         WHERE class_id = ? AND date >= ? AND date <= ?
         ORDER BY date",
    )?;
    let sessions = stmt
        .query_map((&class_id, &date_from, &date_to), |r| {
            let id: String = r.get(0)?;
            let date: String = r.get(1)?;
            let start: Option<String> = r.get(2)?;
            let end: Option<String> = r.get(3)?;
            Ok(json!({
                "id": id,
                "date": date,
                "startTime": start,
                "endTime": end
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(json!({ "classId": class_id, "sessions": sessions }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.enroll" => Some(with_db(state, req, classes_enroll)),
        "sessions.create" => Some(with_db(state, req, sessions_create)),
        "sessions.list" => Some(with_db(state, req, sessions_list)),
        _ => None,
    }
}
