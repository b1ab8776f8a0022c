use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Local};
use rust_xlsxwriter::Workbook;
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
    let exe = env!("CARGO_BIN_EXE_examhalld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn examhalld");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    role: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "role": role,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    role: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, role, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_message(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string()
}

fn upload_base64() -> String {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (c, h) in ["Register Number", "Subject Code", "Internal Mark"]
        .iter()
        .enumerate()
    {
        sheet.write_string(0, c as u16, *h).expect("header");
    }
    sheet.write_number(1, 0, 920001.0).expect("reg");
    sheet.write_string(1, 1, "CS8491").expect("code");
    sheet.write_number(1, 2, 40.0).expect("internal");
    BASE64.encode(workbook.save_to_buffer().expect("save"))
}

struct Portal {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u32,
}

impl Portal {
    fn call(&mut self, method: &str, role: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        request(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            role,
            params,
        )
    }

    fn call_ok(
        &mut self,
        method: &str,
        role: &str,
        params: serde_json::Value,
    ) -> serde_json::Value {
        self.next_id += 1;
        request_ok(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            role,
            params,
        )
    }
}

fn setup() -> (Child, Portal, String) {
    let workspace = temp_dir("examhall-window");
    let (child, stdin, reader) = spawn_sidecar();
    let mut portal = Portal {
        stdin,
        reader,
        next_id: 0,
    };
    let _ = portal.call_ok(
        "workspace.select",
        "admin",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject = portal.call_ok(
        "subjects.create",
        "admin",
        json!({ "code": "CS8491", "name": "Computer Architecture" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    (child, portal, subject_id)
}

fn upload_with_window(
    portal: &mut Portal,
    subject_id: &str,
    start: Option<String>,
    end: Option<String>,
) -> String {
    let result = portal.call_ok(
        "sheets.upload",
        "admin",
        json!({
            "sheetName": "Windowed",
            "subjectId": subject_id,
            "year": "2024 Odd Sem",
            "batch": "V",
            "startDate": start,
            "endDate": end,
            "fileBase64": upload_base64(),
        }),
    );
    result["sheetId"].as_str().expect("sheetId").to_string()
}

fn day(offset: i64) -> String {
    (Local::now().date_naive() + Duration::days(offset))
        .format("%Y-%m-%d")
        .to_string()
}

#[test]
fn future_start_date_blocks_non_admin_reads() {
    let (_child, mut portal, subject_id) = setup();
    let sheet_id = upload_with_window(&mut portal, &subject_id, Some(day(1)), Some(day(10)));

    let denied = portal.call("sheets.get", "staff", json!({ "sheetId": sheet_id }));
    assert_eq!(error_message(&denied), "sheet is not yet available");

    let download = portal.call("sheets.download", "coe", json!({ "sheetId": sheet_id }));
    assert_eq!(error_message(&download), "sheet is not yet available");

    // Admin bypasses the window.
    let meta = portal.call_ok("sheets.get", "admin", json!({ "sheetId": sheet_id }));
    assert_eq!(meta["sheet"]["sheetName"], json!("Windowed"));
}

#[test]
fn past_end_date_blocks_with_distinct_reason() {
    let (_child, mut portal, subject_id) = setup();
    let sheet_id = upload_with_window(&mut portal, &subject_id, Some(day(-10)), Some(day(-1)));

    let denied = portal.call("sheets.get", "staff", json!({ "sheetId": sheet_id }));
    assert_eq!(error_message(&denied), "sheet is no longer available");
}

#[test]
fn end_date_today_is_still_visible() {
    let (_child, mut portal, subject_id) = setup();
    let sheet_id = upload_with_window(&mut portal, &subject_id, Some(day(-10)), Some(day(0)));

    let meta = portal.call_ok("sheets.get", "staff", json!({ "sheetId": sheet_id }));
    assert_eq!(meta["sheet"]["id"], json!(sheet_id));
}

#[test]
fn list_hides_out_of_window_sheets_from_non_admins() {
    let (_child, mut portal, subject_id) = setup();
    let _future = upload_with_window(&mut portal, &subject_id, Some(day(5)), None);

    let staff_view = portal.call_ok("sheets.list", "staff", json!({}));
    assert_eq!(staff_view["sheets"].as_array().map(|a| a.len()), Some(0));

    let admin_view = portal.call_ok("sheets.list", "admin", json!({}));
    assert_eq!(admin_view["sheets"].as_array().map(|a| a.len()), Some(1));
}

#[test]
fn malformed_dates_are_rejected_at_upload() {
    let (_child, mut portal, subject_id) = setup();
    let denied = portal.call(
        "sheets.upload",
        "admin",
        json!({
            "sheetName": "Bad dates",
            "subjectId": subject_id,
            "year": "2024 Odd Sem",
            "batch": "V",
            "startDate": "01-06-2024",
            "fileBase64": upload_base64(),
        }),
    );
    let code = denied["error"]["code"].as_str().unwrap_or("");
    assert_eq!(code, "bad_params");
}
