use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_query, db_update, fetch_sheet, get_opt_i64, get_required_str, role_claim, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::Role;

struct ExaminerParty {
    name: String,
    designation: String,
    department: String,
    college: String,
}

fn required_party(params: &serde_json::Value, key: &str) -> Result<ExaminerParty, HandlerErr> {
    let obj = params
        .get(key)
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))?;
    Ok(ExaminerParty {
        name: get_required_str(obj, "name")?,
        designation: get_required_str(obj, "designation")?,
        department: get_required_str(obj, "department")?,
        college: get_required_str(obj, "college")?,
    })
}

fn optional_party(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<ExaminerParty>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(_) => required_party(params, key).map(Some),
    }
}

/// Write-once per (sheet, bundle). The pre-check is best-effort; the UNIQUE
/// constraint backstops it, and both surface as the same state_error.
fn examiners_set(
    conn: &Connection,
    role: Role,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if role == Role::SubAdmin {
        return Err(HandlerErr::new(
            "forbidden",
            "examiner details are recorded by staff, COE or admin",
        ));
    }
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;
    let bundle_number = get_opt_i64(params, "bundleNumber")
        .ok_or_else(|| HandlerErr::new("bad_params", "missing bundleNumber"))?;
    if bundle_number < 1 {
        return Err(HandlerErr::new("bad_params", "bundleNumber must be >= 1"));
    }
    let internal = required_party(params, "internal")?;
    let chief = optional_party(params, "chief")?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM examiner_details WHERE sheet_id = ? AND bundle_number = ?",
            (&sheet.id, bundle_number),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if existing.is_some() {
        return Err(HandlerErr::new(
            "state_error",
            "examiner details already recorded for this bundle",
        ));
    }

    let id = Uuid::new_v4().to_string();
    let insert = conn.execute(
        "INSERT INTO examiner_details(id, sheet_id, bundle_number,
             internal_name, internal_designation, internal_department, internal_college,
             chief_name, chief_designation, chief_department, chief_college)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &sheet.id,
            bundle_number,
            &internal.name,
            &internal.designation,
            &internal.department,
            &internal.college,
            chief.as_ref().map(|c| c.name.clone()),
            chief.as_ref().map(|c| c.designation.clone()),
            chief.as_ref().map(|c| c.department.clone()),
            chief.as_ref().map(|c| c.college.clone()),
        ],
    );
    match insert {
        Ok(_) => Ok(json!({ "examinerDetailsId": id })),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(HandlerErr::new(
                "state_error",
                "examiner details already recorded for this bundle",
            ))
        }
        Err(e) => Err(db_update(e)),
    }
}

fn examiners_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let sheet = fetch_sheet(conn, &get_required_str(params, "sheetId")?)?;
    let bundle_number = get_opt_i64(params, "bundleNumber");

    let mut sql = "SELECT bundle_number, internal_name, internal_designation,
             internal_department, internal_college, chief_name, chief_designation,
             chief_department, chief_college
         FROM examiner_details WHERE sheet_id = ?"
        .to_string();
    let mut args: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(sheet.id.clone())];
    if let Some(n) = bundle_number {
        sql.push_str(" AND bundle_number = ?");
        args.push(rusqlite::types::Value::Integer(n));
    }
    sql.push_str(" ORDER BY bundle_number");

    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let chief_name: Option<String> = r.get(5)?;
            let chief = chief_name.map(|name| {
                json!({
                    "name": name,
                    "designation": r.get::<_, Option<String>>(6).unwrap_or(None),
                    "department": r.get::<_, Option<String>>(7).unwrap_or(None),
                    "college": r.get::<_, Option<String>>(8).unwrap_or(None),
                })
            });
            Ok(json!({
                "bundleNumber": r.get::<_, i64>(0)?,
                "internal": {
                    "name": r.get::<_, String>(1)?,
                    "designation": r.get::<_, String>(2)?,
                    "department": r.get::<_, String>(3)?,
                    "college": r.get::<_, String>(4)?,
                },
                "chief": chief,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    Ok(json!({ "examiners": rows }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let role = match role_claim(req) {
        Ok(r) => r,
        Err(e) => return e.response(&req.id),
    };
    let result = match req.method.as_str() {
        "examiners.set" => examiners_set(conn, role, &req.params),
        "examiners.get" => examiners_get(conn, &req.params),
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
        "examiners.set" | "examiners.get" => Some(dispatch(state, req)),
        _ => None,
    }
}
