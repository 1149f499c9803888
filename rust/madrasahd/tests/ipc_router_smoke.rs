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

fn spawn_sidecar_with_env(vars: &[(&str, &str)]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_madrasahd");
    let mut cmd = Command::new(exe);
    for (k, v) in vars {
        cmd.env(k, v);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn madrasahd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn_sidecar_with_env(&[])
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

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("madrasah-router-smoke");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());

    let classes = request_ok(&mut stdin, &mut reader, "2", "classes.list", json!({}));
    assert_eq!(
        classes.get("classes").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    let no_ws = request(&mut stdin, &mut reader, "3", "attendance.get", json!({}));
    assert_eq!(error_code(&no_ws), Some("no_workspace"));

    let unknown = request(&mut stdin, &mut reader, "4", "attendance.teleport", json!({}));
    assert_eq!(error_code(&unknown), Some("not_implemented"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let methods = [
        "classes.list",
        "classes.create",
        "classes.enroll",
        "sessions.create",
        "sessions.list",
        "guardians.create",
        "guardians.children",
        "students.create",
        "students.list",
        "students.update",
        "attendance.get",
        "attendance.mark",
        "attendance.setRemarks",
        "attendance.bulkMark",
        "attendance.daySheet",
        "attendance.summary",
        "attendance.roster",
        "attendance.family",
        "attendance.notifyTargets",
        "attendance.policy.get",
        "attendance.policy.update",
        "notifications.list",
        "notifications.markDelivered",
    ];
    for (i, method) in methods.iter().enumerate() {
        let resp = request(&mut stdin, &mut reader, &format!("m{}", i), method, json!({}));
        assert_ne!(error_code(&resp), Some("not_implemented"), "{}", method);
        assert_ne!(error_code(&resp), Some("no_workspace"), "{}", method);
    }
}

#[test]
fn malformed_line_gets_bad_json_and_loop_continues() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&value), Some("bad_json"));

    let _ = request_ok(&mut stdin, &mut reader, "after", "health", json!({}));
}

#[test]
fn workspace_from_environment_is_opened_at_startup() {
    let workspace = temp_dir("madrasah-env-workspace");
    let path = workspace.to_string_lossy().to_string();
    let (_child, mut stdin, mut reader) =
        spawn_sidecar_with_env(&[("MADRASAHD_WORKSPACE", path.as_str()), ("MADRASAHD_LOG", "debug")]);

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(
        health.get("workspacePath").and_then(|v| v.as_str()),
        Some(path.as_str())
    );
    let students = request_ok(&mut stdin, &mut reader, "2", "students.list", json!({}));
    assert_eq!(
        students.get("students").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    assert!(workspace.join("madrasah.sqlite3").exists());
}
