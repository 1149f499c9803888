use crate::ipc::helpers::{get_optional_str, get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use uuid::Uuid;

fn guardians_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let phone = get_optional_str(params, "phone")?;
    let guardian_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO guardians(id, name, phone) VALUES(?, ?, ?)",
        (&guardian_id, &name, &phone),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "guardians" }))
    })?;
    Ok(json!({ "guardianId": guardian_id, "name": name }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let display_name = get_required_str(params, "displayName")?;
    let guardian_id = get_optional_str(params, "guardianId")?;
    if let Some(g) = guardian_id.as_deref() {
        if !SqliteStore::new(conn).guardian_exists(g)? {
            return Err(HandlerErr::new("not_found", "guardian not found"));
        }
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, display_name, guardian_id, active, updated_at)
         VALUES(?, ?, ?, 1, ?)",
        (&student_id, &display_name, &guardian_id, Utc::now().to_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "students" }))
    })?;
    tracing::info!(student_id = %student_id, "student created");

    Ok(json!({
        "studentId": student_id,
        "displayName": display_name,
        "guardianId": guardian_id
    }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    let store = SqliteStore::new(conn);
    if !store.student_exists(&student_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let mut set_parts: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(v) = patch.get("displayName") {
        let name = v.as_str().map(str::trim).unwrap_or("");
        if name.is_empty() {
            return Err(HandlerErr::bad_params("patch.displayName must be a non-empty string"));
        }
        set_parts.push("display_name = ?");
        binds.push(Value::Text(name.to_string()));
    }
    if let Some(v) = patch.get("guardianId") {
        if v.is_null() {
            set_parts.push("guardian_id = ?");
            binds.push(Value::Null);
        } else {
            let Some(g) = v.as_str().map(str::trim).filter(|g| !g.is_empty()) else {
                return Err(HandlerErr::bad_params("patch.guardianId must be a string or null"));
            };
            if !store.guardian_exists(g)? {
                return Err(HandlerErr::new("not_found", "guardian not found"));
            }
            set_parts.push("guardian_id = ?");
            binds.push(Value::Text(g.to_string()));
        }
    }
    if let Some(v) = patch.get("active") {
        let Some(b) = v.as_bool() else {
            return Err(HandlerErr::bad_params("patch.active must be a boolean"));
        };
        set_parts.push("active = ?");
        binds.push(Value::Integer(i64::from(b)));
    }
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }

    set_parts.push("updated_at = ?");
    binds.push(Value::Text(Utc::now().to_rfc3339()));
    binds.push(Value::Text(student_id.clone()));
    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    conn.execute(&sql, params_from_iter(binds)).map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string()).with_details(json!({ "table": "students" }))
    })?;
    tracing::info!(student_id = %student_id, "student updated");
    Ok(json!({ "ok": true }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = SqliteStore::new(conn);
    let students: Vec<serde_json::Value> = match get_optional_str(params, "classId")? {
        Some(class_id) => {
            if !store.class_exists(&class_id)? {
                return Err(HandlerErr::new("not_found", "class not found"));
            }
            store
                .class_roster(&class_id)?
                .into_iter()
                .map(|(id, name)| json!({ "id": id, "displayName": name }))
                .collect()
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, display_name, guardian_id, active
                 FROM students
                 ORDER BY display_name",
            )?;
            stmt.query_map([], |r| {
                let id: String = r.get(0)?;
                let name: String = r.get(1)?;
                let guardian_id: Option<String> = r.get(2)?;
                let active: i64 = r.get(3)?;
                Ok(json!({
                    "id": id,
                    "displayName": name,
                    "guardianId": guardian_id,
                    "active": active != 0
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?
        }
    };
    Ok(json!({ "students": students }))
}

fn guardians_children(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let guardian_id = get_required_str(params, "guardianId")?;
    if !SqliteStore::new(conn).guardian_exists(&guardian_id)? {
        return Err(HandlerErr::new("not_found", "guardian not found"));
    }
    let children: Vec<serde_json::Value> = SqliteStore::new(conn)
        .guardian_children(&guardian_id)?
        .into_iter()
        .map(|(id, name)| json!({ "id": id, "displayName": name }))
        .collect();
    Ok(json!({ "guardianId": guardian_id, "children": children }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "guardians.create" => Some(with_db(state, req, guardians_create)),
        "guardians.children" => Some(with_db(state, req, guardians_children)),
        "students.create" => Some(with_db(state, req, students_create)),
        "students.list" => Some(with_db(state, req, students_list)),
        "students.update" => Some(with_db(state, req, students_update)),
        _ => None,
    }
}
