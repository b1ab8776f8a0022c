use rusqlite::Connection;
use serde_json::json;

use crate::blob::BlobStore;
use crate::bundle;
use crate::codec::Cell;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    blob_store, check_visibility, fetch_sheet, get_required_str, load_sheet_table, role_claim,
    subject_code, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::Role;
use crate::reconcile::Field;

/// Bundle membership is recomputed on demand and never persisted, so the
/// staff and COE views always agree with each other.
fn bundles_list(
    conn: &Connection,
    store: &BlobStore,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
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
    let register = Field::RegisterNumber.canonical_name();
    let bundles = bundle::partition(
        &table.rows,
        duplicate,
        reconciled.attendance_key(),
        &code,
    );

    let bundles_json: Vec<serde_json::Value> = bundles
        .iter()
        .map(|b| {
            let members: Vec<serde_json::Value> = b
                .rows
                .iter()
                .map(|r| {
                    json!({
                        "registerNumber": r.get(register).map(Cell::as_text).unwrap_or_default(),
                        "duplicateNumber": r.get(duplicate).and_then(Cell::as_f64),
                    })
                })
                .collect();
            json!({
                "name": b.name,
                "number": b.number,
                "size": b.rows.len(),
                "members": members,
            })
        })
        .collect();

    Ok(json!({ "bundles": bundles_json }))
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
    match bundles_list(conn, &store, role, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "bundles.list" => Some(dispatch(state, req)),
        _ => None,
    }
}
