use crate::ipc::helpers::{get_optional_bool, get_required_str, get_string_list, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;

fn notifications_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let pending_only = get_optional_bool(params, "pending", true)?;
    let sql = if pending_only {
        "SELECT o.id, o.entity_id, s.display_name, o.reason, o.created_at, o.delivered_at
         FROM notification_outbox o
         LEFT JOIN students s ON s.id = o.entity_id
         WHERE o.delivered_at IS NULL
         ORDER BY o.created_at, o.id"
    } else {
        "SELECT o.id, o.entity_id, s.display_name, o.reason, o.created_at, o.delivered_at
         FROM notification_outbox o
         LEFT JOIN students s ON s.id = o.entity_id
         ORDER BY o.created_at, o.id"
    };
    let mut stmt = conn.prepare(sql)?;
    let items = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let entity_id: String = r.get(1)?;
            let name: Option<String> = r.get(2)?;
            let reason: String = r.get(3)?;
            let created_at: String = r.get(4)?;
            let delivered_at: Option<String> = r.get(5)?;
            Ok(json!({
                "id": id,
                "entityId": entity_id,
                "displayName": name,
                "reason": reason,
                "createdAt": created_at,
                "deliveredAt": delivered_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "notifications": items }))
}

fn notifications_mark_delivered(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ids = match params.get("ids") {
        Some(_) => get_string_list(params, "ids")?,
        None => vec![get_required_str(params, "id")?],
    };
    let now = Utc::now().to_rfc3339();
    let mut updated = 0usize;
    let mut missing: Vec<String> = Vec::new();
    for id in ids {
        let changed = conn
            .execute(
                "UPDATE notification_outbox SET delivered_at = ?
                 WHERE id = ? AND delivered_at IS NULL",
                (&now, &id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        if changed == 0 {
            missing.push(id);
        } else {
            updated += 1;
        }
    }
    Ok(json!({ "updated": updated, "notFound": missing }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.list" => Some(with_db(state, req, notifications_list)),
        "notifications.markDelivered" => Some(with_db(state, req, notifications_mark_delivered)),
        _ => None,
    }
}
