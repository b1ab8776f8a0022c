use rusqlite::Connection;
use serde_json::json;

use crate::blob::BlobStore;
use crate::codec::Cell;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    blob_store, check_visibility, db_update, fetch_sheet, get_required_str, load_sheet_table,
    role_claim, entry_text, store_sheet_table, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{can_edit, Role, Stage};
use crate::reconcile::{Field, Reconciled};

/// Sheets uploaded without an attendance column gain one on first save; it
/// takes its canonical slot, before a Duplicate Number column and the mark
/// columns.
fn order_with_attendance(reconciled: &Reconciled) -> Vec<String> {
    let mut order = reconciled.header_order(false);
    if !reconciled.has(Field::Attendance) {
        let at = order
            .iter()
            .position(|h| {
                h == Field::DuplicateNumber.canonical_name()
                    || reconciled.mark_columns.first() == Some(h)
                    || h == "Total"
            })
            .unwrap_or(order.len());
        order.insert(at, Field::Attendance.canonical_name().to_string());
    }
    order
}

fn attendance_open(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if !can_edit(role, Stage::Attendance) {
        return Err(HandlerErr::new(
            "forbidden",
            "attendance entry requires the sub-admin or admin role",
        ));
    }
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;
    check_visibility(&sheet, role)?;
    let (table, _) = load_sheet_table(store, &sheet)?;

    let register = Field::RegisterNumber.canonical_name();
    let attendance = Field::Attendance.canonical_name();
    let rows: Vec<serde_json::Value> = table
        .rows
        .iter()
        .map(|row| {
            json!({
                "registerNumber": row.get(register).map(Cell::as_text).unwrap_or_default(),
                "attendance": row.get(attendance).map(Cell::as_text).unwrap_or_default(),
            })
        })
        .collect();

    Ok(json!({
        "sheet": sheet.meta_json(),
        "rows": rows,
    }))
}

fn attendance_save(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if !can_edit(role, Stage::Attendance) {
        return Err(HandlerErr::new(
            "forbidden",
            "attendance entry requires the sub-admin or admin role",
        ));
    }
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;
    check_visibility(&sheet, role)?;

    // Stage already completed: only the admin re-opening path may rewrite.
    let override_mode = sheet.flags.attendance_marked;
    if override_mode && !role.is_admin() {
        return Err(HandlerErr::new(
            "state_error",
            "attendance is already marked for this sheet",
        ));
    }

    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing entries"));
    };

    let (mut table, reconciled) = load_sheet_table(store, &sheet)?;
    let register = Field::RegisterNumber.canonical_name();
    let attendance = Field::Attendance.canonical_name().to_string();

    let mut updated = 0usize;
    let mut unknown: Vec<String> = Vec::new();
    for entry in entries {
        let reg = entry_text(entry, "registerNumber")?;
        let value = entry
            .get("attendance")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if !value.is_empty()
            && !value.eq_ignore_ascii_case("present")
            && !value.eq_ignore_ascii_case("absent")
        {
            return Err(HandlerErr::with_details(
                "bad_params",
                "attendance must be Present, Absent or empty",
                json!({ "value": value }),
            ));
        }

        let mut found = false;
        for row in table.rows.iter_mut() {
            let row_reg = row.get(register).map(Cell::as_text).unwrap_or_default();
            if row_reg.trim() == reg.trim() {
                let cell = if value.is_empty() {
                    Cell::Empty
                } else if value.eq_ignore_ascii_case("present") {
                    Cell::Text("Present".to_string())
                } else {
                    Cell::Text("Absent".to_string())
                };
                row.insert(attendance.clone(), cell);
                found = true;
            }
        }
        if found {
            updated += 1;
        } else {
            unknown.push(reg);
        }
    }

    let order = order_with_attendance(&reconciled);
    store_sheet_table(store, &sheet, &table.rows, &order)?;

    // Flag flips only after the blob write landed, and only when the save
    // actually recorded attendance for at least one row.
    if updated > 0 && !sheet.flags.attendance_marked {
        conn.execute(
            "UPDATE sheets SET attendance_marked = 1 WHERE id = ?",
            [&sheet.id],
        )
        .map_err(db_update)?;
    }

    Ok(json!({
        "updated": updated,
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
    let result = match req.method.as_str() {
        "attendance.open" => attendance_open(conn, &store, role, &req.params),
        "attendance.save" => attendance_save(conn, &store, role, &req.params),
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
        "attendance.open" | "attendance.save" => Some(dispatch(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::reconcile;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn retrofitted_attendance_takes_its_canonical_slot() {
        // Duplicate Number already present: Attendance must land before it.
        let r = reconcile(&headers(&[
            "Register Number",
            "Subject Code",
            "Internal Mark",
            "Duplicate Number",
            "1",
        ]))
        .expect("reconcile");
        assert_eq!(
            order_with_attendance(&r),
            vec![
                "Register Number",
                "Subject Code",
                "Internal Mark",
                "Attendance",
                "Duplicate Number",
                "1",
                "Total",
                "Result"
            ]
        );
    }

    #[test]
    fn existing_attendance_column_is_left_alone() {
        let r = reconcile(&headers(&[
            "Register Number",
            "Subject Code",
            "Internal Mark",
            "Attendance",
        ]))
        .expect("reconcile");
        let order = order_with_attendance(&r);
        assert_eq!(
            order.iter().filter(|h| h.as_str() == "Attendance").count(),
            1
        );
    }
}
