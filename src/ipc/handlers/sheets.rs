use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::blob::{self, BlobStore};
use crate::codec::{self, Row};
use crate::derive::{self, RowFilter};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    blob_store, check_visibility, db_query, db_update, decode_base64, encode_base64, fetch_sheet,
    get_opt_date, get_opt_i64, get_opt_str, get_required_str, is_visible, load_sheet_table,
    role_claim, row_json, sheet_from_row, storage, subject_code, HandlerErr, SheetRecord,
    SHEET_COLUMNS,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{can_edit, Role, Stage};
use crate::reconcile::{self, Classification};

fn require_admin(role: Role) -> Result<(), HandlerErr> {
    if role.is_admin() {
        Ok(())
    } else {
        Err(HandlerErr::new("forbidden", "admin role required"))
    }
}

fn validate_max_internal(value: i64) -> Result<i64, HandlerErr> {
    if (1..=99).contains(&value) {
        Ok(value)
    } else {
        Err(HandlerErr::with_details(
            "bad_params",
            "maximumInternalMark must be between 1 and 99",
            json!({ "value": value }),
        ))
    }
}

fn sheets_upload(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(role)?;

    let sheet_name = get_required_str(params, "sheetName")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let department_id = get_opt_str(params, "departmentId");
    let year = get_required_str(params, "year")?;
    let batch = get_required_str(params, "batch")?;
    let start_date = get_opt_date(params, "startDate")?;
    let end_date = get_opt_date(params, "endDate")?;
    let maximum_internal_mark =
        validate_max_internal(get_opt_i64(params, "maximumInternalMark").unwrap_or(50))?;
    let bytes = decode_base64(&get_required_str(params, "fileBase64")?)?;

    let code = subject_code(conn, &subject_id)?;
    if let Some(dept) = &department_id {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM departments WHERE id = ?", [dept], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db_query)?;
        if exists.is_none() {
            return Err(HandlerErr::new("not_found", "department not found"));
        }
    }

    let table = codec::decode(&bytes)
        .map_err(|e| HandlerErr::new("format_error", format!("{:#}", e)))?;
    let reconciled = reconcile::reconcile(&table.headers).map_err(|e| {
        HandlerErr::with_details("missing_columns", e.to_string(), json!({ "missing": e.0 }))
    })?;

    let subject_header = reconciled
        .original_header(reconcile::Field::SubjectCode)
        .unwrap_or_default()
        .to_string();
    let mut matched: Vec<Row> = Vec::new();
    let mut mismatched: Vec<serde_json::Value> = Vec::new();
    for row in &table.rows {
        match reconcile::classify(row, &subject_header, &code) {
            Classification::Matched => matched.push(reconciled.remap_row(row)),
            // Surfaced for operator review in upload order, then discarded.
            Classification::Mismatched => mismatched.push(row_json(row, &table.headers)),
        }
    }

    let upload_id = Uuid::new_v4().to_string();
    let file_path = blob::sheet_path(
        department_id.as_deref(),
        &subject_id,
        &year,
        &batch,
        &upload_id,
    );

    // Shared subjects reuse one blob per term: merge new matched rows into
    // the existing file and keep the existing sheet record.
    let existing: Option<SheetRecord> = conn
        .query_row(
            &format!("SELECT {} FROM sheets WHERE file_path = ?", SHEET_COLUMNS),
            [&file_path],
            |r| sheet_from_row(r),
        )
        .optional()
        .map_err(db_query)?;

    if let Some(sheet) = existing {
        let (mut table, _) = load_sheet_table(store, &sheet)?;
        let matched_count = matched.len();
        table.rows.extend(matched);
        // Union the stored headers with the new upload's canonical headers,
        // then re-reconcile the union: mark or passthrough columns present
        // on only one side survive the merge, with marks back in ascending
        // order.
        let mut union = table.headers.clone();
        for header in reconciled.header_order(false) {
            if !union.contains(&header) {
                union.push(header);
            }
        }
        let merged = reconcile::reconcile(&union).map_err(|e| {
            HandlerErr::with_details("missing_columns", e.to_string(), json!({ "missing": e.0 }))
        })?;
        let order = merged.header_order(false);
        let bytes = codec::encode(&table.rows, &order)
            .map_err(|e| HandlerErr::new("format_error", format!("{:#}", e)))?;
        store.put(&sheet.file_path, &bytes, true).map_err(storage)?;
        return Ok(json!({
            "sheetId": sheet.id,
            "merged": true,
            "matched": matched_count,
            "mismatched": mismatched,
        }));
    }

    let order = reconciled.header_order(false);
    let encoded = codec::encode(&matched, &order)
        .map_err(|e| HandlerErr::new("format_error", format!("{:#}", e)))?;
    store.put(&file_path, &encoded, false).map_err(storage)?;

    let sheet_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sheets(id, sheet_name, file_path, department_id, subject_id, year, batch,
             start_date, end_date, maximum_internal_mark, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &sheet_id,
            sheet_name.trim(),
            &file_path,
            &department_id,
            &subject_id,
            &year,
            &batch,
            &start_date,
            &end_date,
            maximum_internal_mark,
            &created_at,
        ],
    )
    .map_err(db_update)?;

    Ok(json!({
        "sheetId": sheet_id,
        "merged": false,
        "matched": matched.len(),
        "mismatched": mismatched,
    }))
}

fn sheets_list(
    conn: &Connection,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = format!("SELECT {} FROM sheets WHERE 1=1", SHEET_COLUMNS);
    let mut args: Vec<Value> = Vec::new();

    if let Some(subject_id) = get_opt_str(params, "subjectId") {
        sql.push_str(" AND subject_id = ?");
        args.push(Value::Text(subject_id));
    }
    if let Some(department_id) = get_opt_str(params, "departmentId") {
        sql.push_str(" AND department_id = ?");
        args.push(Value::Text(department_id));
    }
    for (key, column) in [
        ("attendanceMarked", "attendance_marked"),
        ("duplicatesGenerated", "duplicates_generated"),
        ("externalMarksAdded", "external_marks_added"),
        ("isDownloaded", "is_downloaded"),
    ] {
        if let Some(want) = params.get(key).and_then(|v| v.as_bool()) {
            sql.push_str(&format!(" AND {} = ?", column));
            args.push(Value::Integer(want as i64));
        }
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let sheets = stmt
        .query_map(params_from_iter(args.iter()), |r| sheet_from_row(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    // Non-admin callers only see sheets inside their visibility window.
    let visible: Vec<serde_json::Value> = sheets
        .iter()
        .filter(|s| is_visible(s, role))
        .map(|s| s.meta_json())
        .collect();
    Ok(json!({ "sheets": visible }))
}

fn sheets_get(
    conn: &Connection,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;
    check_visibility(&sheet, role)?;
    Ok(json!({ "sheet": sheet.meta_json() }))
}

fn sheets_download(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;
    check_visibility(&sheet, role)?;
    let bytes = store.get(&sheet.file_path).map_err(storage)?;
    Ok(json!({
        "fileName": format!("{}.xlsx", sheet.sheet_name),
        "fileBase64": encode_base64(&bytes),
    }))
}

fn sheets_update_meta(
    conn: &Connection,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(role)?;
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;

    let mut sets: Vec<String> = Vec::new();
    let mut args: Vec<Value> = Vec::new();
    if let Some(name) = get_opt_str(params, "sheetName") {
        sets.push("sheet_name = ?".to_string());
        args.push(Value::Text(name.trim().to_string()));
    }
    if params.get("startDate").is_some() {
        sets.push("start_date = ?".to_string());
        args.push(match get_opt_date(params, "startDate")? {
            Some(d) => Value::Text(d),
            None => Value::Null,
        });
    }
    if params.get("endDate").is_some() {
        sets.push("end_date = ?".to_string());
        args.push(match get_opt_date(params, "endDate")? {
            Some(d) => Value::Text(d),
            None => Value::Null,
        });
    }
    if let Some(max) = get_opt_i64(params, "maximumInternalMark") {
        sets.push("maximum_internal_mark = ?".to_string());
        args.push(Value::Integer(validate_max_internal(max)?));
    }
    if let Some(year) = get_opt_str(params, "year") {
        sets.push("year = ?".to_string());
        args.push(Value::Text(year));
    }
    if let Some(batch) = get_opt_str(params, "batch") {
        sets.push("batch = ?".to_string());
        args.push(Value::Text(batch));
    }
    if sets.is_empty() {
        return Err(HandlerErr::new("bad_params", "no fields to update"));
    }

    let sql = format!("UPDATE sheets SET {} WHERE id = ?", sets.join(", "));
    args.push(Value::Text(sheet.id.clone()));
    conn.execute(&sql, params_from_iter(args.iter()))
        .map_err(db_update)?;
    Ok(json!({ "ok": true }))
}

fn sheets_delete(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(role)?;
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;

    // Blob first, record second. A failure in between leaves a record with a
    // dangling path, which a re-run of delete clears.
    if store.exists(&sheet.file_path) {
        store.delete(&sheet.file_path).map_err(storage)?;
    }
    conn.execute("DELETE FROM examiner_details WHERE sheet_id = ?", [&sheet.id])
        .map_err(db_update)?;
    conn.execute("DELETE FROM sheets WHERE id = ?", [&sheet.id])
        .map_err(db_update)?;
    Ok(json!({ "ok": true }))
}

fn sheets_export(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;
    check_visibility(&sheet, role)?;
    let filter = match get_opt_str(params, "filter") {
        Some(raw) => RowFilter::parse(&raw).ok_or_else(|| {
            HandlerErr::with_details(
                "bad_params",
                "filter must be one of: all, pass, fail, absent, above50",
                json!({ "filter": raw }),
            )
        })?,
        None => RowFilter::All,
    };

    let (table, reconciled) = load_sheet_table(store, &sheet)?;
    let kept = derive::filter_rows(
        &table.rows,
        &reconciled,
        sheet.maximum_internal_mark,
        filter,
    );
    let derived: Vec<Row> = kept
        .iter()
        .map(|row| derive::apply_derived(row, &reconciled, sheet.maximum_internal_mark))
        .collect();

    let order = reconciled.header_order(false);
    let bytes = if reconciled.mark_columns.is_empty() {
        codec::encode(&derived, &order)
    } else {
        // Banner spans the numbered mark columns; cosmetic only.
        let first = order
            .iter()
            .position(|h| h == &reconciled.mark_columns[0])
            .unwrap_or(0);
        let last = first + reconciled.mark_columns.len() - 1;
        codec::encode_grouped(&derived, &order, ("External Marks", first, last))
    }
    .map_err(|e| HandlerErr::new("format_error", format!("{:#}", e)))?;

    Ok(json!({
        "fileName": format!("{}-export.xlsx", sheet.sheet_name),
        "rows": derived.len(),
        "fileBase64": encode_base64(&bytes),
    }))
}

/// Bulk archive: every sheet with external marks complete and not yet
/// archived moves to the archive location. Failures are collected per sheet,
/// never aborting the batch; already-archived sheets are excluded up front,
/// which makes the operation idempotent.
fn sheets_archive_all(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
) -> Result<serde_json::Value, HandlerErr> {
    if !can_edit(role, Stage::Archive) {
        return Err(HandlerErr::new(
            "forbidden",
            "archive requires the COE or admin role",
        ));
    }

    let sql = format!(
        "SELECT {} FROM sheets WHERE external_marks_added = 1 AND is_downloaded = 0",
        SHEET_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let candidates = stmt
        .query_map([], |r| sheet_from_row(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let mut archived = 0usize;
    let mut failures: Vec<serde_json::Value> = Vec::new();
    for sheet in &candidates {
        let moved = match store.archive(&sheet.file_path) {
            Ok(path) => path,
            Err(e) => {
                failures.push(json!({ "sheetId": sheet.id, "error": format!("{:#}", e) }));
                continue;
            }
        };
        match conn.execute(
            "UPDATE sheets SET file_path = ?, is_downloaded = 1 WHERE id = ?",
            (&moved, &sheet.id),
        ) {
            Ok(_) => archived += 1,
            Err(e) => {
                failures.push(json!({ "sheetId": sheet.id, "error": e.to_string() }));
            }
        }
    }

    Ok(json!({
        "candidates": candidates.len(),
        "archived": archived,
        "failed": failures.len(),
        "failures": failures,
    }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let store = match blob_store(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let role = match role_claim(req) {
        Ok(r) => r,
        Err(e) => return e.response(&req.id),
    };

    let result = match req.method.as_str() {
        "sheets.upload" => sheets_upload(conn, &store, role, &req.params),
        "sheets.list" => sheets_list(conn, role, &req.params),
        "sheets.get" => sheets_get(conn, role, &req.params),
        "sheets.download" => sheets_download(conn, &store, role, &req.params),
        "sheets.updateMeta" => sheets_update_meta(conn, role, &req.params),
        "sheets.delete" => sheets_delete(conn, &store, role, &req.params),
        "sheets.export" => sheets_export(conn, &store, role, &req.params),
        "sheets.archiveAll" => sheets_archive_all(conn, &store, role),
        _ => {
            return err(&req.id, "not_implemented", format!("unknown method: {}", req.method), None)
        }
    };
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sheets.upload" | "sheets.list" | "sheets.get" | "sheets.download"
        | "sheets.updateMeta" | "sheets.delete" | "sheets.export" | "sheets.archiveAll" => {
            Some(dispatch(state, req))
        }
        _ => None,
    }
}
