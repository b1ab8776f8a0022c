use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use calamine::{Data, Reader, Xlsx};
use rust_xlsxwriter::Workbook;
use serde_json::json;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Cursor, Write};
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

struct Portal {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u32,
}

impl Portal {
    fn call(&mut self, method: &str, role: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({
            "id": id,
            "method": method,
            "role": role,
            "params": params,
        });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn call_ok(
        &mut self,
        method: &str,
        role: &str,
        params: serde_json::Value,
    ) -> serde_json::Value {
        let value = self.call(method, role, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }
}

/// Decodes an exported workbook into maps keyed by header text, skipping the
/// merged "External Marks" banner row when present.
fn decode_export(base64_file: &str) -> Vec<HashMap<String, String>> {
    let bytes = BASE64.decode(base64_file).expect("base64 file");
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes)).expect("open workbook");
    let range = workbook
        .worksheet_range_at(0)
        .expect("first worksheet")
        .expect("read worksheet");

    let all: Vec<Vec<String>> = range
        .rows()
        .map(|r| {
            r.iter()
                .map(|d| match d {
                    Data::Empty => String::new(),
                    Data::Float(f) if f.fract() == 0.0 => format!("{}", *f as i64),
                    other => other.to_string(),
                })
                .collect()
        })
        .collect();

    let mut rows = all.into_iter();
    let mut headers = rows.next().expect("header row");
    if headers.iter().filter(|c| !c.trim().is_empty()).count() <= 1 {
        headers = rows.next().expect("real header row");
    }

    rows.map(|cells| {
        headers
            .iter()
            .zip(cells.into_iter())
            .filter(|(h, _)| !h.trim().is_empty())
            .map(|(h, v)| (h.clone(), v))
            .collect()
    })
    .collect()
}

fn seed_sheet(portal: &mut Portal) -> String {
    let subject = portal.call_ok(
        "subjects.create",
        "admin",
        json!({ "code": "CS8491", "name": "Computer Architecture" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId");

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    let headers = [
        "Register Number",
        "Subject Code",
        "Internal Mark",
        "Attendance",
        "1",
        "2",
        "3",
    ];
    for (c, h) in headers.iter().enumerate() {
        sheet.write_string(0, c as u16, *h).expect("header");
    }
    // internal 40, marks 75 -> total 78, Pass
    // internal 25, marks 40 -> total 45, Fail
    // absent -> AAA
    // internal 45, marks 50 -> total 70, Pass
    let rows: [(f64, f64, &str, [Option<f64>; 3]); 4] = [
        (920001.0, 40.0, "Present", [Some(40.0), Some(20.0), Some(15.0)]),
        (920002.0, 25.0, "Present", [Some(20.0), Some(20.0), None]),
        (920003.0, 40.0, "Absent", [None, None, None]),
        (920004.0, 45.0, "Present", [Some(25.0), Some(25.0), None]),
    ];
    for (i, (reg, internal, attendance, marks)) in rows.iter().enumerate() {
        let r = (i + 1) as u32;
        sheet.write_number(r, 0, *reg).expect("reg");
        sheet.write_string(r, 1, "CS8491").expect("code");
        sheet.write_number(r, 2, *internal).expect("internal");
        sheet.write_string(r, 3, *attendance).expect("attendance");
        for (c, mark) in marks.iter().enumerate() {
            if let Some(m) = mark {
                sheet.write_number(r, (4 + c) as u16, *m).expect("mark");
            }
        }
    }
    let file = BASE64.encode(workbook.save_to_buffer().expect("save"));

    let upload = portal.call_ok(
        "sheets.upload",
        "admin",
        json!({
            "sheetName": "CA final",
            "subjectId": subject_id,
            "year": "2024 Even Sem",
            "batch": "IV",
            "fileBase64": file,
        }),
    );
    assert_eq!(upload["matched"], json!(4));
    upload["sheetId"].as_str().expect("sheetId").to_string()
}

fn setup() -> (Child, Portal, String) {
    let workspace = temp_dir("examhall-export");
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
    let sheet_id = seed_sheet(&mut portal);
    (child, portal, sheet_id)
}

fn export_registers(portal: &mut Portal, sheet_id: &str, filter: &str) -> Vec<String> {
    let result = portal.call_ok(
        "sheets.export",
        "admin",
        json!({ "sheetId": sheet_id, "filter": filter }),
    );
    decode_export(result["fileBase64"].as_str().expect("file"))
        .iter()
        .map(|row| row["Register Number"].clone())
        .collect()
}

#[test]
fn full_export_carries_derived_total_and_result() {
    let (_child, mut portal, sheet_id) = setup();
    let result = portal.call_ok("sheets.export", "admin", json!({ "sheetId": sheet_id }));
    assert_eq!(result["rows"], json!(4));

    let rows = decode_export(result["fileBase64"].as_str().expect("file"));
    let by_register: HashMap<&str, &HashMap<String, String>> = rows
        .iter()
        .map(|r| (r["Register Number"].as_str(), r))
        .collect();

    let top = by_register["920001"];
    assert_eq!(top["Total"], "78");
    assert_eq!(top["Result"], "Pass");

    let failed = by_register["920002"];
    assert_eq!(failed["Total"], "45");
    assert_eq!(failed["Result"], "Fail");

    let absent = by_register["920003"];
    assert_eq!(absent["Result"], "AAA");
}

#[test]
fn pass_and_fail_filters_partition_present_rows() {
    let (_child, mut portal, sheet_id) = setup();

    let mut passed = export_registers(&mut portal, &sheet_id, "pass");
    passed.sort();
    assert_eq!(passed, vec!["920001", "920004"]);

    assert_eq!(export_registers(&mut portal, &sheet_id, "fail"), vec!["920002"]);
    assert_eq!(
        export_registers(&mut portal, &sheet_id, "absent"),
        vec!["920003"]
    );
}

#[test]
fn above50_filter_is_on_total_marks() {
    let (_child, mut portal, sheet_id) = setup();
    let mut over = export_registers(&mut portal, &sheet_id, "above50");
    over.sort();
    // Totals 78 and 70 qualify; 45 and the absent row's 40 do not.
    assert_eq!(over, vec!["920001", "920004"]);
}

#[test]
fn unknown_filter_is_rejected() {
    let (_child, mut portal, sheet_id) = setup();
    let denied = portal.call(
        "sheets.export",
        "admin",
        json!({ "sheetId": sheet_id, "filter": "top10" }),
    );
    assert_eq!(denied["error"]["code"], json!("bad_params"));
}
