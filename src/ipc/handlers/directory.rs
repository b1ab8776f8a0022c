use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_query, db_update, get_opt_str, get_required_str, role_claim, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn departments_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM departments ORDER BY name")
        .map_err(db_query)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "departments": rows }))
}

fn departments_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    if name.trim().is_empty() {
        return Err(HandlerErr::new("bad_params", "department name is empty"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO departments(id, name) VALUES(?, ?)",
        (&id, name.trim()),
    )
    .map_err(db_update)?;
    Ok(json!({ "departmentId": id }))
}

fn departments_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "departmentId")?;
    let name = get_required_str(params, "name")?;
    let changed = conn
        .execute(
            "UPDATE departments SET name = ? WHERE id = ?",
            (name.trim(), &id),
        )
        .map_err(db_update)?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "department not found"));
    }
    Ok(json!({ "ok": true }))
}

fn departments_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "departmentId")?;
    let changed = conn
        .execute("DELETE FROM departments WHERE id = ?", [&id])
        .map_err(db_update)?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "department not found"));
    }
    Ok(json!({ "ok": true }))
}

fn subjects_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let department_id = get_opt_str(params, "departmentId");
    let mut sql =
        "SELECT id, department_id, code, name, semester FROM subjects".to_string();
    let mut args: Vec<String> = Vec::new();
    if let Some(dept) = &department_id {
        // Department views also see shared (common) subjects.
        sql.push_str(" WHERE department_id = ? OR department_id IS NULL");
        args.push(dept.clone());
    }
    sql.push_str(" ORDER BY code");

    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "departmentId": r.get::<_, Option<String>>(1)?,
                "code": r.get::<_, String>(2)?,
                "name": r.get::<_, String>(3)?,
                "semester": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "subjects": rows }))
}

fn subjects_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;
    let department_id = get_opt_str(params, "departmentId");
    let semester = get_opt_str(params, "semester");
    if code.trim().is_empty() {
        return Err(HandlerErr::new("bad_params", "subject code is empty"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, department_id, code, name, semester) VALUES(?, ?, ?, ?, ?)",
        (&id, &department_id, code.trim(), name.trim(), &semester),
    )
    .map_err(db_update)?;
    Ok(json!({ "subjectId": id }))
}

fn subjects_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "subjectId")?;
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;
    let semester = get_opt_str(params, "semester");
    let changed = conn
        .execute(
            "UPDATE subjects SET code = ?, name = ?, semester = ? WHERE id = ?",
            (code.trim(), name.trim(), &semester, &id),
        )
        .map_err(db_update)?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "subject not found"));
    }
    Ok(json!({ "ok": true }))
}

fn subjects_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "subjectId")?;
    let changed = conn
        .execute("DELETE FROM subjects WHERE id = ?", [&id])
        .map_err(db_update)?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "subject not found"));
    }
    Ok(json!({ "ok": true }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // Directory edits are admin-only; reads are open to every role.
    let is_edit = req.method.ends_with(".create")
        || req.method.ends_with(".update")
        || req.method.ends_with(".delete");
    if is_edit {
        match role_claim(req) {
            Ok(role) if role.is_admin() => {}
            Ok(_) => return err(&req.id, "forbidden", "admin role required", None),
            Err(e) => return e.response(&req.id),
        }
    }

    let result = match req.method.as_str() {
        "departments.list" => departments_list(conn),
        "departments.create" => departments_create(conn, &req.params),
        "departments.update" => departments_update(conn, &req.params),
        "departments.delete" => departments_delete(conn, &req.params),
        "subjects.list" => subjects_list(conn, &req.params),
        "subjects.create" => subjects_create(conn, &req.params),
        "subjects.update" => subjects_update(conn, &req.params),
        "subjects.delete" => subjects_delete(conn, &req.params),
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
        "departments.list" | "departments.create" | "departments.update" | "departments.delete"
        | "subjects.list" | "subjects.create" | "subjects.update" | "subjects.delete" => {
            Some(dispatch(state, req))
        }
        _ => None,
    }
}
