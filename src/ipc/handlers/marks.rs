use rusqlite::Connection;
use serde_json::json;

use crate::blob::BlobStore;
use crate::bundle;
use crate::codec::Cell;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    blob_store, check_visibility, db_update, fetch_sheet, get_opt_i64, get_required_str,
    load_sheet_table, role_claim, row_json, store_sheet_table, subject_code, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{can_edit, external_marks_complete, Role, Stage};
use crate::reconcile::Field;

/// Entry view for one bundle (or the whole sheet): duplicate number plus
/// the numbered mark columns. No register numbers leave this call.
fn marks_open(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if !can_edit(role, Stage::ExternalMarks) {
        return Err(HandlerErr::new(
            "forbidden",
            "external mark entry requires the staff or admin role",
        ));
    }
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;
    check_visibility(&sheet, role)?;
    if !sheet.flags.duplicates_generated {
        return Err(HandlerErr::new(
            "state_error",
            "duplicate numbers are not generated yet",
        ));
    }

    let code = subject_code(conn, &sheet.subject_id)?;
    let (table, reconciled) = load_sheet_table(store, &sheet)?;
    let duplicate = Field::DuplicateNumber.canonical_name();
    let bundles = bundle::partition(
        &table.rows,
        duplicate,
        reconciled.attendance_key(),
        &code,
    );

    let mut view_headers = vec![duplicate.to_string()];
    view_headers.extend(reconciled.mark_columns.iter().cloned());

    let selected: Vec<&bundle::Bundle> = match get_opt_i64(params, "bundleNumber") {
        Some(n) => bundles
            .iter()
            .filter(|b| b.number == n as usize)
            .collect(),
        None => bundles.iter().collect(),
    };
    if selected.is_empty() {
        return Err(HandlerErr::new("not_found", "bundle not found"));
    }

    let bundles_json: Vec<serde_json::Value> = selected
        .iter()
        .map(|b| {
            json!({
                "name": b.name,
                "number": b.number,
                "rows": b.rows.iter().map(|r| row_json(r, &view_headers)).collect::<Vec<_>>(),
            })
        })
        .collect();

    Ok(json!({
        "sheet": sheet.meta_json(),
        "markColumns": reconciled.mark_columns,
        "bundles": bundles_json,
    }))
}

/// Saves external marks keyed by duplicate number. Partial fills are normal;
/// the external_marks_added flag flips only when every present row carries a
/// mark, and only after the blob write succeeded.
fn marks_save(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if !can_edit(role, Stage::ExternalMarks) {
        return Err(HandlerErr::new(
            "forbidden",
            "external mark entry requires the staff or admin role",
        ));
    }
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;
    check_visibility(&sheet, role)?;
    if !sheet.flags.duplicates_generated {
        return Err(HandlerErr::new(
            "state_error",
            "duplicate numbers are not generated yet",
        ));
    }
    let override_mode = sheet.flags.external_marks_added;
    if override_mode && !role.is_admin() {
        return Err(HandlerErr::new(
            "state_error",
            "external marks are already finalized for this sheet",
        ));
    }

    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing entries"));
    };

    let (mut table, reconciled) = load_sheet_table(store, &sheet)?;
    if reconciled.mark_columns.is_empty() {
        return Err(HandlerErr::new(
            "state_error",
            "sheet has no numbered mark columns",
        ));
    }
    let duplicate = Field::DuplicateNumber.canonical_name();

    let mut updated = 0usize;
    let mut unknown: Vec<f64> = Vec::new();
    for entry in entries {
        let dup = entry
            .get("duplicateNumber")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| HandlerErr::new("bad_params", "missing duplicateNumber"))?;
        let Some(marks) = entry.get("marks").and_then(|v| v.as_object()) else {
            return Err(HandlerErr::new("bad_params", "missing marks"));
        };

        for (column, value) in marks {
            if !reconciled.mark_columns.contains(column) {
                return Err(HandlerErr::with_details(
                    "bad_params",
                    "unknown mark column",
                    json!({ "column": column }),
                ));
            }
            let mark = value
                .as_f64()
                .ok_or_else(|| HandlerErr::new("bad_params", "mark must be numeric"))?;
            if !(0.0..=100.0).contains(&mark) {
                return Err(HandlerErr::with_details(
                    "bad_params",
                    "mark must be between 0 and 100",
                    json!({ "column": column, "value": mark }),
                ));
            }
        }

        let mut found = false;
        for row in table.rows.iter_mut() {
            let row_dup = row.get(duplicate).and_then(Cell::as_f64);
            if row_dup == Some(dup) {
                for (column, value) in marks {
                    let mark = value.as_f64().unwrap_or(0.0);
                    row.insert(column.clone(), Cell::Number(mark));
                }
                found = true;
            }
        }
        if found {
            updated += 1;
        } else {
            unknown.push(dup);
        }
    }

    let order = reconciled.header_order(false);
    store_sheet_table(store, &sheet, &table.rows, &order)?;

    let complete = external_marks_complete(
        &table.rows,
        &reconciled.mark_columns,
        reconciled.attendance_key(),
    );
    if complete && !sheet.flags.external_marks_added {
        conn.execute(
            "UPDATE sheets SET external_marks_added = 1 WHERE id = ?",
            [&sheet.id],
        )
        .map_err(db_update)?;
    }

    Ok(json!({
        "updated": updated,
        "unknownDuplicateNumbers": unknown,
        "complete": complete,
        "override": override_mode,
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
        "marks.open" => marks_open(conn, &store, role, &req.params),
        "marks.save" => marks_save(conn, &store, role, &req.params),
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
        "marks.open" | "marks.save" => Some(dispatch(state, req)),
        _ => None,
    }
}
