use rusqlite::Connection;
use serde_json::json;

use crate::blob::BlobStore;
use crate::codec::Cell;
use crate::derive::is_present;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    blob_store, check_visibility, db_update, entry_text, fetch_sheet, get_required_str,
    load_sheet_table, role_claim, store_sheet_table, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{can_edit, Role, Stage};
use crate::reconcile::{Field, Reconciled};

fn order_with_duplicate_number(reconciled: &Reconciled) -> Vec<String> {
    let mut order = reconciled.header_order(false);
    if !reconciled.has(Field::DuplicateNumber) {
        let at = order
            .iter()
            .position(|h| reconciled.mark_columns.first() == Some(h) || h == "Total")
            .unwrap_or(order.len());
        order.insert(at, Field::DuplicateNumber.canonical_name().to_string());
    }
    order
}

/// Assigns duplicate (anonymizing) numbers to present rows. With explicit
/// assignments each entry names a register number; without, numbers run
/// sequentially over present rows in sheet order.
fn duplicates_assign(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if !can_edit(role, Stage::Duplicates) {
        return Err(HandlerErr::new(
            "forbidden",
            "duplicate assignment requires the sub-admin or admin role",
        ));
    }
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;
    check_visibility(&sheet, role)?;

    if !sheet.flags.attendance_marked {
        return Err(HandlerErr::new(
            "state_error",
            "attendance must be marked before duplicate numbers are generated",
        ));
    }
    let override_mode = sheet.flags.duplicates_generated;
    if override_mode && !role.is_admin() {
        return Err(HandlerErr::new(
            "state_error",
            "duplicate numbers are already generated for this sheet",
        ));
    }

    let (mut table, reconciled) = load_sheet_table(store, &sheet)?;
    let register = Field::RegisterNumber.canonical_name();
    let duplicate = Field::DuplicateNumber.canonical_name().to_string();
    let attendance_key = reconciled.attendance_key();

    let mut assigned = 0usize;
    let mut unknown: Vec<String> = Vec::new();
    match params.get("assignments").and_then(|v| v.as_array()) {
        Some(entries) => {
            for entry in entries {
                let reg = entry_text(entry, "registerNumber")?;
                let number = entry
                    .get("duplicateNumber")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| {
                        HandlerErr::new("bad_params", "missing duplicateNumber")
                    })?;
                let mut found = false;
                for row in table.rows.iter_mut() {
                    let row_reg = row.get(register).map(Cell::as_text).unwrap_or_default();
                    if row_reg.trim() == reg.trim() {
                        row.insert(duplicate.clone(), Cell::Number(number));
                        found = true;
                    }
                }
                if found {
                    assigned += 1;
                } else {
                    unknown.push(reg);
                }
            }
        }
        None => {
            let mut next = 1.0;
            for row in table.rows.iter_mut() {
                if attendance_key.is_some() && !is_present(row, attendance_key) {
                    continue;
                }
                row.insert(duplicate.clone(), Cell::Number(next));
                next += 1.0;
                assigned += 1;
            }
        }
    }

    let order = order_with_duplicate_number(&reconciled);
    store_sheet_table(store, &sheet, &table.rows, &order)?;

    // A run that assigned nothing (no present rows, or every entry unknown)
    // leaves the stage open.
    if assigned > 0 && !sheet.flags.duplicates_generated {
        conn.execute(
            "UPDATE sheets SET duplicates_generated = 1 WHERE id = ?",
            [&sheet.id],
        )
        .map_err(db_update)?;
    }

    Ok(json!({
        "assigned": assigned,
        "unknownRegisterNumbers": unknown,
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
    match duplicates_assign(conn, &store, role, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "duplicates.assign" => Some(dispatch(state, req)),
        _ => None,
    }
}
