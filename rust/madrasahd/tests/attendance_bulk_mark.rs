use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_madrasahd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn madrasahd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

struct Fixture {
    class_id: String,
    enrolled: Vec<String>,
    outsider: String,
}

fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(stdin, reader, "c", "classes.create", json!({ "name": "Hifz A" }));
    let class_id = str_field(&class, "classId");

    let mut ids = Vec::new();
    for (i, name) in ["Aisha Rahman", "Yusuf Ali", "Maryam Khan"].iter().enumerate() {
        let s = request_ok(
            stdin,
            reader,
            &format!("s{}", i),
            "students.create",
            json!({ "displayName": name }),
        );
        ids.push(str_field(&s, "studentId"));
    }
    let outsider = ids.pop().expect("three students");

    let enroll = request_ok(
        stdin,
        reader,
        "enroll",
        "classes.enroll",
        json!({ "classId": class_id, "studentIds": ids }),
    );
    assert_eq!(enroll.get("enrolled").and_then(|v| v.as_u64()), Some(2));

    let _ = request_ok(
        stdin,
        reader,
        "session",
        "sessions.create",
        json!({ "classId": class_id, "date": "2024-01-15", "startTime": "08:00" }),
    );

    Fixture {
        class_id,
        enrolled: ids,
        outsider,
    }
}

#[test]
fn bulk_absent_is_visible_and_idempotent() {
    let workspace = temp_dir("madrasah-bulk-idempotent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "attendance.bulkMark",
        json!({
            "entityIds": fx.enrolled,
            "classId": fx.class_id,
            "date": "2024-01-15",
            "status": "ABSENT"
        }),
    );
    assert_eq!(first.get("outcome").and_then(|v| v.as_str()), Some("complete"));
    assert_eq!(
        first.get("succeeded").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );
    let targets = first
        .get("notifyTargets")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(targets.len(), 2);
    assert!(targets
        .iter()
        .all(|t| t.get("reason").and_then(|v| v.as_str()) == Some("NEWLY_ABSENT")));
    assert!(first.get("notifications").map(|v| v.is_null()).unwrap_or(false));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "attendance.get",
        json!({ "filters": { "classId": fx.class_id, "date": "2024-01-15" } }),
    );
    assert_eq!(got.get("count").and_then(|v| v.as_u64()), Some(2));
    let records = got.get("records").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    assert!(records
        .iter()
        .all(|r| r.get("status").and_then(|v| v.as_str()) == Some("ABSENT")));

    // Same request again: still one record per student, nothing new to notify.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "b2",
        "attendance.bulkMark",
        json!({
            "entityIds": fx.enrolled,
            "classId": fx.class_id,
            "date": "2024-01-15",
            "status": "ABSENT"
        }),
    );
    assert_eq!(
        again.get("notifyTargets").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "attendance.get",
        json!({ "filters": { "classId": fx.class_id, "date": "2024-01-15" } }),
    );
    assert_eq!(got.get("count").and_then(|v| v.as_u64()), Some(2));

    // Switching status rewrites in place.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "b3",
        "attendance.bulkMark",
        json!({
            "entityIds": fx.enrolled,
            "classId": fx.class_id,
            "date": "2024-01-15",
            "status": "present"
        }),
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "g3",
        "attendance.get",
        json!({ "filters": { "classId": fx.class_id, "status": "ABSENT" } }),
    );
    assert_eq!(got.get("count").and_then(|v| v.as_u64()), Some(0));
}

#[test]
fn bulk_without_session_is_rejected_unless_waived() {
    let workspace = temp_dir("madrasah-bulk-no-session");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);

    let resp = request(
        &mut stdin,
        &mut reader,
        "b1",
        "attendance.bulkMark",
        json!({
            "entityIds": fx.enrolled,
            "classId": fx.class_id,
            "date": "2024-01-16",
            "status": "PRESENT"
        }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&resp), Some("not_found"));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "attendance.get",
        json!({ "filters": { "date": "2024-01-16" } }),
    );
    assert_eq!(got.get("count").and_then(|v| v.as_u64()), Some(0));

    let waived = request_ok(
        &mut stdin,
        &mut reader,
        "b2",
        "attendance.bulkMark",
        json!({
            "entityIds": fx.enrolled,
            "classId": fx.class_id,
            "date": "2024-01-16",
            "status": "PRESENT",
            "requireSession": false
        }),
    );
    assert_eq!(waived.get("outcome").and_then(|v| v.as_str()), Some("complete"));
}

#[test]
fn bulk_reports_partial_failure_per_entity() {
    let workspace = temp_dir("madrasah-bulk-partial");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);

    let mut ids = fx.enrolled.clone();
    ids.push(fx.outsider.clone());
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "attendance.bulkMark",
        json!({
            "entityIds": ids,
            "classId": fx.class_id,
            "date": "2024-01-15",
            "status": "LATE",
            "remarksByEntity": { (fx.enrolled[0].clone()): "traffic" }
        }),
    );
    assert_eq!(result.get("outcome").and_then(|v| v.as_str()), Some("partial"));
    let failed = result.get("failed").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    assert_eq!(failed.len(), 1);
    assert_eq!(
        failed[0].get("entityId").and_then(|v| v.as_str()),
        Some(fx.outsider.as_str())
    );
    assert_eq!(failed[0].get("code").and_then(|v| v.as_str()), Some("not_found"));
    assert_eq!(
        result.get("retryable").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let records = result.get("records").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    assert_eq!(records.len(), 2);
    let with_remark = records
        .iter()
        .find(|r| r.get("entityId").and_then(|v| v.as_str()) == Some(fx.enrolled[0].as_str()))
        .expect("first student record");
    assert_eq!(with_remark.get("remarks").and_then(|v| v.as_str()), Some("traffic"));
}

#[test]
fn bulk_rejects_malformed_requests() {
    let workspace = temp_dir("madrasah-bulk-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);

    let cases = vec![
        json!({ "entityIds": [], "classId": fx.class_id, "date": "2024-01-15", "status": "PRESENT" }),
        json!({ "entityIds": fx.enrolled, "classId": fx.class_id, "date": "15/01/2024", "status": "PRESENT" }),
        json!({ "entityIds": fx.enrolled, "classId": fx.class_id, "date": "2024-01-15", "status": "UNMARKED" }),
        json!({ "entityIds": fx.enrolled, "date": "2024-01-15", "status": "PRESENT" }),
        json!({
            "entityIds": fx.enrolled,
            "classId": fx.class_id,
            "date": "2024-01-15",
            "status": "PRESENT",
            "remarksByEntity": { "somebody-else": "x" }
        }),
        json!({
            "entityIds": fx.enrolled,
            "classId": fx.class_id,
            "date": "2024-01-15",
            "status": "PRESENT",
            "requireSession": "no"
        }),
        json!({
            "entityIds": fx.enrolled,
            "classId": fx.class_id,
            "date": "2024-01-15",
            "status": "PRESENT",
            "notify": "yes"
        }),
    ];
    for (i, params) in cases.into_iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad{}", i),
            "attendance.bulkMark",
            params,
        );
        assert_eq!(error_code(&resp), Some("bad_params"), "case {}: {}", i, resp);
    }

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "g",
        "attendance.get",
        json!({}),
    );
    assert_eq!(got.get("count").and_then(|v| v.as_u64()), Some(0));
}
