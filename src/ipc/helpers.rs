use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::blob::BlobStore;
use crate::codec::{self, Table};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{check_window, Role, SheetFlags, WindowCheck};
use crate::reconcile::{self, Reconciled};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn db_query(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn db_update(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_update_failed", e.to_string())
}

pub fn storage(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("storage_failed", format!("{:#}", e))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
}

pub fn get_opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Validates an optional "YYYY-MM-DD" date parameter. An explicit null or a
/// missing key clears/skips the field; anything else must parse.
pub fn get_opt_date(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v.as_str().ok_or_else(|| {
                HandlerErr::new("bad_params", format!("{} must be a YYYY-MM-DD string", key))
            })?;
            parse_date(s).map_err(|_| {
                HandlerErr::with_details(
                    "bad_params",
                    format!("{} is not a valid YYYY-MM-DD date", key),
                    json!({ "value": s }),
                )
            })?;
            Ok(Some(s.to_string()))
        }
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
}

/// Role claim of the request. A missing claim defaults to staff, the least
/// privileged role; an unrecognized one is a validation error.
pub fn role_claim(req: &Request) -> Result<Role, HandlerErr> {
    match req.role.as_deref() {
        None => Ok(Role::Staff),
        Some(s) => Role::parse(s).ok_or_else(|| {
            HandlerErr::with_details("bad_params", "unknown role claim", json!({ "role": s }))
        }),
    }
}

pub fn blob_store(state: &AppState) -> Result<BlobStore, HandlerErr> {
    state
        .workspace
        .as_ref()
        .map(|w| BlobStore::new(w))
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn decode_base64(value: &str) -> Result<Vec<u8>, HandlerErr> {
    BASE64
        .decode(value.trim())
        .map_err(|e| HandlerErr::new("bad_params", format!("file payload is not base64: {}", e)))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

#[derive(Debug, Clone)]
pub struct SheetRecord {
    pub id: String,
    pub sheet_name: String,
    pub file_path: String,
    pub department_id: Option<String>,
    pub subject_id: String,
    pub year: String,
    pub batch: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub maximum_internal_mark: i64,
    pub flags: SheetFlags,
    pub created_at: String,
}

impl SheetRecord {
    pub fn meta_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "sheetName": self.sheet_name,
            "filePath": self.file_path,
            "departmentId": self.department_id,
            "subjectId": self.subject_id,
            "year": self.year,
            "batch": self.batch,
            "startDate": self.start_date,
            "endDate": self.end_date,
            "maximumInternalMark": self.maximum_internal_mark,
            "attendanceMarked": self.flags.attendance_marked,
            "duplicatesGenerated": self.flags.duplicates_generated,
            "externalMarksAdded": self.flags.external_marks_added,
            "isDownloaded": self.flags.is_downloaded,
            "createdAt": self.created_at,
        })
    }
}

pub const SHEET_COLUMNS: &str = "id, sheet_name, file_path, department_id, subject_id, year, \
     batch, start_date, end_date, maximum_internal_mark, attendance_marked, \
     duplicates_generated, external_marks_added, is_downloaded, created_at";

pub fn sheet_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SheetRecord> {
    Ok(SheetRecord {
        id: r.get(0)?,
        sheet_name: r.get(1)?,
        file_path: r.get(2)?,
        department_id: r.get(3)?,
        subject_id: r.get(4)?,
        year: r.get(5)?,
        batch: r.get(6)?,
        start_date: r.get(7)?,
        end_date: r.get(8)?,
        maximum_internal_mark: r.get(9)?,
        flags: SheetFlags {
            attendance_marked: r.get::<_, i64>(10)? != 0,
            duplicates_generated: r.get::<_, i64>(11)? != 0,
            external_marks_added: r.get::<_, i64>(12)? != 0,
            is_downloaded: r.get::<_, i64>(13)? != 0,
        },
        created_at: r.get(14)?,
    })
}

pub fn fetch_sheet(conn: &Connection, sheet_id: &str) -> Result<SheetRecord, HandlerErr> {
    let sql = format!("SELECT {} FROM sheets WHERE id = ?", SHEET_COLUMNS);
    conn.query_row(&sql, [sheet_id], |r| sheet_from_row(r))
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| HandlerErr::new("not_found", "sheet not found"))
}

pub fn subject_code(conn: &Connection, subject_id: &str) -> Result<String, HandlerErr> {
    conn.query_row("SELECT code FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get::<_, String>(0)
    })
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| HandlerErr::new("not_found", "subject not found"))
}

/// Visibility gate for non-admin reads. Runs before any blob or row data is
/// fetched; only the already-loaded sheet metadata is consulted.
pub fn check_visibility(sheet: &SheetRecord, role: Role) -> Result<(), HandlerErr> {
    if role.is_admin() {
        return Ok(());
    }
    let parse = |v: &Option<String>| v.as_deref().and_then(|s| parse_date(s).ok());
    let today = chrono::Local::now().date_naive();
    match check_window(parse(&sheet.start_date), parse(&sheet.end_date), today) {
        WindowCheck::Visible => Ok(()),
        outcome => Err(HandlerErr::with_details(
            "state_error",
            outcome.reason(),
            json!({ "startDate": sheet.start_date, "endDate": sheet.end_date }),
        )),
    }
}

/// Whether a sheet is inside its visibility window right now (list filtering).
pub fn is_visible(sheet: &SheetRecord, role: Role) -> bool {
    check_visibility(sheet, role).is_ok()
}

/// One read side of the read-modify-write cycle: fetch the sheet's blob,
/// decode it and reconcile its headers.
pub fn load_sheet_table(
    store: &BlobStore,
    sheet: &SheetRecord,
) -> Result<(Table, Reconciled), HandlerErr> {
    let bytes = store.get(&sheet.file_path).map_err(storage)?;
    let table = codec::decode(&bytes)
        .map_err(|e| HandlerErr::new("format_error", format!("{:#}", e)))?;
    let reconciled = reconcile::reconcile(&table.headers).map_err(|e| {
        HandlerErr::with_details(
            "missing_columns",
            e.to_string(),
            json!({ "missing": e.0 }),
        )
    })?;
    Ok((table, reconciled))
}

/// Reads a field that spreadsheets blur between text and number (register
/// numbers, duplicate numbers). Accepts either JSON form.
pub fn entry_text(entry: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    match entry.get(key) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(HandlerErr::new("bad_params", format!("missing {}", key))),
    }
}

/// Projects a row onto JSON in header order for handler responses. Numbers
/// stay numeric; blanks become nulls.
pub fn row_json(row: &crate::codec::Row, headers: &[String]) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for header in headers {
        let value = match row.get(header) {
            Some(crate::codec::Cell::Number(n)) => json!(n),
            Some(crate::codec::Cell::Text(s)) => json!(s),
            Some(crate::codec::Cell::Empty) | None => serde_json::Value::Null,
        };
        obj.insert(header.clone(), value);
    }
    serde_json::Value::Object(obj)
}

/// The write side: re-encode the full row set and overwrite the blob. The
/// caller flips lifecycle flags only after this returns Ok.
pub fn store_sheet_table(
    store: &BlobStore,
    sheet: &SheetRecord,
    rows: &[crate::codec::Row],
    header_order: &[String],
) -> Result<(), HandlerErr> {
    let bytes = codec::encode(rows, header_order)
        .map_err(|e| HandlerErr::new("format_error", format!("{:#}", e)))?;
    store.put(&sheet.file_path, &bytes, true).map_err(storage)
}
