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
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
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

#[test]
fn health_reports_version_and_no_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(resp["ok"], json!(true));
    assert!(resp["result"]["version"].is_string());
    assert!(resp["result"]["workspacePath"].is_null());
}

#[test]
fn unknown_method_is_not_implemented() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(&mut stdin, &mut reader, "1", "fees.doesNotExist", json!({}));
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("not_implemented"));
}

#[test]
fn methods_require_a_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    for method in [
        "classes.list",
        "students.register",
        "fees.markPayment",
        "fees.imposeLateFine",
    ] {
        let resp = request(&mut stdin, &mut reader, "1", method, json!({}));
        assert_eq!(resp["ok"], json!(false), "{} before workspace", method);
        assert_eq!(resp["error"]["code"], json!("no_workspace"));
    }
}

#[test]
fn workspace_select_then_basic_crud() {
    let workspace = temp_dir("campus-smoke");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(resp["ok"], json!(true));

    let created = request(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grade 5", "fee": 500, "lateFineAmount": 100 }),
    );
    assert_eq!(created["ok"], json!(true));
    assert_eq!(created["result"]["fee"], json!(500));
    assert_eq!(created["result"]["students"], json!([]));

    let listed = request(&mut stdin, &mut reader, "3", "classes.list", json!({}));
    assert_eq!(listed["ok"], json!(true));
    let classes = listed["result"]["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0]["studentCount"], json!(0));
}

#[test]
fn class_create_rejects_negative_fee() {
    let workspace = temp_dir("campus-smoke-neg");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grade 5", "fee": -10 }),
    );
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("invalid_input"));
    assert_eq!(resp["error"]["details"]["status"], json!(400));
}

#[test]
fn class_removal_refuses_while_students_enrolled() {
    let workspace = temp_dir("campus-smoke-remove");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grade 5" }),
    );
    let class_id = class["result"]["id"].as_str().expect("class id").to_string();
    request(
        &mut stdin,
        &mut reader,
        "3",
        "students.register",
        json!({ "name": "Asha", "email": "asha@school.test", "classId": class_id }),
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "classes.remove",
        json!({ "classId": class_id }),
    );
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("invalid_state"));
    assert_eq!(resp["error"]["details"]["status"], json!(422));
}
