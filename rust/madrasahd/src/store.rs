use crate::attendance::error::{AttendanceError, AttendanceResult};
use crate::attendance::filter::{self, RecordFilter};
use crate::attendance::notify::{Ack, Notifier, NotifyReason};
use crate::attendance::record::{AttendanceRecord, RecordDraft, RecordKey};
use crate::attendance::status::{AttendanceStatus, PresencePolicy};
use crate::attendance::AttendanceStore;
use crate::db;
use chrono::{NaiveDate, NaiveTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use uuid::Uuid;

pub const POLICY_SETTINGS_KEY: &str = "attendance.policy";

const RECORD_COLUMNS: &str =
    "id, entity_id, class_id, date, status, remarks, arrival_time, departure_time, updated_at";

struct RawRecord {
    id: String,
    entity_id: String,
    class_id: Option<String>,
    date: String,
    status: String,
    remarks: Option<String>,
    arrival_time: Option<String>,
    departure_time: Option<String>,
    updated_at: Option<String>,
}

impl RawRecord {
    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRecord {
            id: r.get(0)?,
            entity_id: r.get(1)?,
            class_id: r.get(2)?,
            date: r.get(3)?,
            status: r.get(4)?,
            remarks: r.get(5)?,
            arrival_time: r.get(6)?,
            departure_time: r.get(7)?,
            updated_at: r.get(8)?,
        })
    }

    fn into_record(self) -> AttendanceResult<AttendanceRecord> {
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
            .map_err(|e| AttendanceError::query_failed(format!("bad stored date {}: {}", self.date, e)))?;
        let status = AttendanceStatus::parse(&self.status)
            .map_err(|e| AttendanceError::query_failed(format!("bad stored status: {}", e)))?;
        Ok(AttendanceRecord {
            id: self.id,
            entity_id: self.entity_id,
            class_id: self.class_id,
            date,
            status,
            remarks: self.remarks,
            arrival_time: parse_stored_time(self.arrival_time)?,
            departure_time: parse_stored_time(self.departure_time)?,
            updated_at: self.updated_at,
        })
    }
}

fn parse_stored_time(raw: Option<String>) -> AttendanceResult<Option<NaiveTime>> {
    raw.map(|s| {
        NaiveTime::parse_from_str(&s, "%H:%M:%S")
            .map_err(|e| AttendanceError::query_failed(format!("bad stored time {}: {}", s, e)))
    })
    .transpose()
}

fn format_time(t: Option<NaiveTime>) -> Option<String> {
    t.map(|t| t.format("%H:%M:%S").to_string())
}

fn class_key(class_id: Option<&str>) -> &str {
    class_id.unwrap_or("")
}

/// SQLite-backed persistence for one open workspace.
pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn find_record(&self, key: &RecordKey) -> AttendanceResult<Option<AttendanceRecord>> {
        let sql = format!(
            "SELECT {} FROM attendance_records WHERE entity_id = ? AND class_key = ? AND date = ?",
            RECORD_COLUMNS
        );
        let raw = self
            .conn
            .query_row(
                &sql,
                (
                    &key.entity_id,
                    class_key(key.class_id.as_deref()),
                    key.date.to_string(),
                ),
                RawRecord::from_row,
            )
            .optional()
            .map_err(AttendanceError::query_failed)?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Replaces remarks without touching status. `None` clears them.
    pub fn set_remarks(&self, key: &RecordKey, remarks: Option<&str>) -> AttendanceResult<AttendanceRecord> {
        let changed = self
            .conn
            .execute(
                "UPDATE attendance_records SET remarks = ?, updated_at = ?
                 WHERE entity_id = ? AND class_key = ? AND date = ?",
                (
                    remarks,
                    Utc::now().to_rfc3339(),
                    &key.entity_id,
                    class_key(key.class_id.as_deref()),
                    key.date.to_string(),
                ),
            )
            .map_err(AttendanceError::update_failed)?;
        if changed == 0 {
            return Err(AttendanceError::not_found("attendance record not found"));
        }
        self.find_record(key)?
            .ok_or_else(|| AttendanceError::not_found("attendance record not found"))
    }

    pub fn student_exists(&self, student_id: &str) -> AttendanceResult<bool> {
        self.conn
            .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map(|v| v.is_some())
            .map_err(AttendanceError::query_failed)
    }

    pub fn class_exists(&self, class_id: &str) -> AttendanceResult<bool> {
        self.conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map(|v| v.is_some())
            .map_err(AttendanceError::query_failed)
    }

    pub fn guardian_exists(&self, guardian_id: &str) -> AttendanceResult<bool> {
        self.conn
            .query_row("SELECT 1 FROM guardians WHERE id = ?", [guardian_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map(|v| v.is_some())
            .map_err(AttendanceError::query_failed)
    }

    /// Active enrolled students of a class as (id, display name), in roster order.
    pub fn class_roster(&self, class_id: &str) -> AttendanceResult<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT s.id, s.display_name
                 FROM enrollments e
                 JOIN students s ON s.id = e.student_id
                 WHERE e.class_id = ? AND s.active = 1
                 ORDER BY e.sort_order, s.display_name",
            )
            .map_err(AttendanceError::query_failed)?;
        stmt.query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(AttendanceError::query_failed)
    }

    pub fn guardian_children(&self, guardian_id: &str) -> AttendanceResult<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, display_name FROM students
                 WHERE guardian_id = ?
                 ORDER BY display_name",
            )
            .map_err(AttendanceError::query_failed)?;
        stmt.query_map([guardian_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(AttendanceError::query_failed)
    }

    pub fn display_names(&self) -> AttendanceResult<HashMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, display_name FROM students")
            .map_err(AttendanceError::query_failed)?;
        stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
            .map_err(AttendanceError::query_failed)
    }
}

impl AttendanceStore for SqliteStore<'_> {
    fn get_records(&self, filter: &RecordFilter) -> AttendanceResult<Vec<AttendanceRecord>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<Value> = Vec::new();
        if let Some(id) = filter.entity_id() {
            clauses.push("entity_id = ?");
            binds.push(Value::Text(id.to_string()));
        }
        if let Some(class_id) = &filter.class_id {
            clauses.push("class_id = ?");
            binds.push(Value::Text(class_id.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            binds.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(from) = filter.date_from {
            clauses.push("date >= ?");
            binds.push(Value::Text(from.to_string()));
        }
        if let Some(to) = filter.date_to {
            clauses.push("date <= ?");
            binds.push(Value::Text(to.to_string()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM attendance_records {} ORDER BY date, entity_id, class_key",
            RECORD_COLUMNS, where_sql
        );

        let mut stmt = self.conn.prepare(&sql).map_err(AttendanceError::query_failed)?;
        let raw = stmt
            .query_map(params_from_iter(binds), RawRecord::from_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(AttendanceError::query_failed)?;
        let records = raw
            .into_iter()
            .map(RawRecord::into_record)
            .collect::<AttendanceResult<Vec<_>>>()?;

        if filter.name_needle().is_some() {
            let names = self.display_names()?;
            return filter::select(&records, filter, Some(&names));
        }
        Ok(records)
    }

    fn upsert_record(&self, draft: &RecordDraft) -> AttendanceResult<AttendanceRecord> {
        let record_id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO attendance_records(
                   id, entity_id, class_id, class_key, date, status,
                   remarks, arrival_time, departure_time, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(entity_id, class_key, date) DO UPDATE SET
                   status = excluded.status,
                   remarks = COALESCE(excluded.remarks, attendance_records.remarks),
                   arrival_time = COALESCE(excluded.arrival_time, attendance_records.arrival_time),
                   departure_time = COALESCE(excluded.departure_time, attendance_records.departure_time),
                   updated_at = excluded.updated_at",
                rusqlite::params![
                    record_id,
                    draft.entity_id,
                    draft.class_id,
                    class_key(draft.class_id.as_deref()),
                    draft.date.to_string(),
                    draft.status.as_str(),
                    draft.remarks,
                    format_time(draft.arrival_time),
                    format_time(draft.departure_time),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(AttendanceError::update_failed)?;
        self.find_record(&draft.key())?.ok_or_else(|| {
            AttendanceError::update_failed("record missing after upsert")
        })
    }

    fn session_exists(&self, class_id: &str, date: NaiveDate) -> AttendanceResult<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM class_sessions WHERE class_id = ? AND date = ?",
                (class_id, date.to_string()),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.is_some())
            .map_err(AttendanceError::query_failed)
    }

    fn entity_enrolled(&self, entity_id: &str, class_id: &str) -> AttendanceResult<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM enrollments WHERE class_id = ? AND student_id = ?",
                (class_id, entity_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.is_some())
            .map_err(AttendanceError::query_failed)
    }
}

pub fn load_policy(conn: &Connection) -> AttendanceResult<PresencePolicy> {
    let raw = db::settings_get_json(conn, POLICY_SETTINGS_KEY).map_err(AttendanceError::query_failed)?;
    let Some(raw) = raw else {
        return Ok(PresencePolicy::default());
    };
    let policy: PresencePolicy = serde_json::from_value(raw)
        .map_err(|e| AttendanceError::query_failed(format!("stored policy is unreadable: {}", e)))?;
    policy.validate()?;
    Ok(policy)
}

pub fn save_policy(conn: &Connection, policy: &PresencePolicy) -> AttendanceResult<()> {
    policy.validate()?;
    let value = serde_json::to_value(policy).map_err(AttendanceError::update_failed)?;
    db::settings_set_json(conn, POLICY_SETTINGS_KEY, &value).map_err(AttendanceError::update_failed)
}

/// Queues notifications in the workspace outbox for the messaging layer to drain.
pub struct OutboxNotifier<'a> {
    conn: &'a Connection,
}

impl<'a> OutboxNotifier<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl Notifier for OutboxNotifier<'_> {
    fn notify(&self, entity_id: &str, reason: NotifyReason) -> AttendanceResult<Ack> {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO notification_outbox(id, entity_id, reason, created_at)
                 VALUES(?, ?, ?, ?)",
                (&id, entity_id, reason.as_str(), Utc::now().to_rfc3339()),
            )
            .map_err(AttendanceError::update_failed)?;
        Ok(Ack { notification_id: id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::bulk::{apply_bulk, BulkRequest};
    use crate::attendance::filter::EntityMatch;
    use crate::attendance::notify::{dispatch, NotifyTarget};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        conn.execute("INSERT INTO classes(id, name) VALUES('c1','Hifz A')", [])
            .expect("class");
        for (i, (id, name)) in [("s1", "Aisha Rahman"), ("s2", "Yusuf Ali")].iter().enumerate() {
            conn.execute(
                "INSERT INTO students(id, display_name) VALUES(?, ?)",
                (id, name),
            )
            .expect("student");
            conn.execute(
                "INSERT INTO enrollments(class_id, student_id, sort_order) VALUES('c1', ?, ?)",
                (id, i as i64),
            )
            .expect("enroll");
        }
        conn.execute(
            "INSERT INTO class_sessions(id, class_id, date) VALUES('x1','c1','2024-01-15')",
            [],
        )
        .expect("session");
        conn
    }

    fn jan15() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).expect("date")
    }

    #[test]
    fn upsert_keeps_one_row_per_key() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let draft = RecordDraft::new("s1", Some("c1".to_string()), jan15(), AttendanceStatus::Absent)
            .with_remarks(Some("no call"));
        let first = store.upsert_record(&draft).expect("first");
        let second = store
            .upsert_record(&RecordDraft::new("s1", Some("c1".to_string()), jan15(), AttendanceStatus::Present))
            .expect("second");
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, AttendanceStatus::Present);
        assert_eq!(second.remarks.as_deref(), Some("no call"));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM attendance_records", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn null_class_still_unique() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        store
            .upsert_record(&RecordDraft::new("s1", None, jan15(), AttendanceStatus::Absent))
            .expect("first");
        let rec = store
            .upsert_record(&RecordDraft::new("s1", None, jan15(), AttendanceStatus::Excused))
            .expect("second");
        assert_eq!(rec.class_id, None);
        let all = store.get_records(&RecordFilter::default()).expect("records");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, AttendanceStatus::Excused);
    }

    #[test]
    fn bulk_against_sqlite_then_query() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let req = BulkRequest::new(
            vec!["s1".to_string(), "s2".to_string()],
            "c1",
            jan15(),
            AttendanceStatus::Absent,
        );
        let res = apply_bulk(&store, &req, None).expect("bulk");
        assert_eq!(res.succeeded.len(), 2);
        let got = store
            .get_records(&RecordFilter::for_class_date("c1", jan15()))
            .expect("records");
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|r| r.status == AttendanceStatus::Absent));
    }

    #[test]
    fn name_filter_goes_through_lookup() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        for id in ["s1", "s2"] {
            store
                .upsert_record(&RecordDraft::new(id, Some("c1".to_string()), jan15(), AttendanceStatus::Present))
                .expect("upsert");
        }
        let f = RecordFilter {
            entity: Some(EntityMatch::NameContains("yusuf".to_string())),
            ..RecordFilter::default()
        };
        let got = store.get_records(&f).expect("records");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].entity_id, "s2");
    }

    #[test]
    fn set_remarks_leaves_status() {
        let conn = setup();
        let store = SqliteStore::new(&conn);
        let rec = store
            .upsert_record(&RecordDraft::new("s1", Some("c1".to_string()), jan15(), AttendanceStatus::Late))
            .expect("upsert");
        let updated = store.set_remarks(&rec.key(), Some("bus delay")).expect("remarks");
        assert_eq!(updated.status, AttendanceStatus::Late);
        assert_eq!(updated.remarks.as_deref(), Some("bus delay"));
        let cleared = store.set_remarks(&rec.key(), None).expect("clear");
        assert_eq!(cleared.remarks, None);

        let mut missing = rec.key();
        missing.entity_id = "s2".to_string();
        assert_eq!(store.set_remarks(&missing, Some("x")).unwrap_err().code(), "not_found");
    }

    #[test]
    fn policy_defaults_until_saved() {
        let conn = setup();
        assert_eq!(load_policy(&conn).expect("load"), PresencePolicy::default());
        let p = PresencePolicy {
            excused_weight: 0.5,
            ..PresencePolicy::default()
        };
        save_policy(&conn, &p).expect("save");
        assert_eq!(load_policy(&conn).expect("load"), p);
    }

    #[test]
    fn outbox_notifier_queues_rows() {
        let conn = setup();
        let n = OutboxNotifier::new(&conn);
        let report = dispatch(
            &n,
            &[NotifyTarget {
                entity_id: "s1".to_string(),
                reason: NotifyReason::NewlyAbsent,
            }],
        );
        assert_eq!(report.sent.len(), 1);
        let reason: String = conn
            .query_row("SELECT reason FROM notification_outbox WHERE entity_id = 's1'", [], |r| r.get(0))
            .expect("row");
        assert_eq!(reason, "NEWLY_ABSENT");
    }
}
