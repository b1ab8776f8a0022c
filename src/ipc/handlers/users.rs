use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_query, db_update, get_opt_str, get_required_str, role_claim, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::Role;

fn validate_role(role: &str) -> Result<String, HandlerErr> {
    Role::parse(role)
        .map(|_| role.trim().to_ascii_lowercase())
        .ok_or_else(|| {
            HandlerErr::with_details("bad_params", "unknown role", json!({ "role": role }))
        })
}

fn users_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, email, role, department_id FROM users ORDER BY name")
        .map_err(db_query)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "departmentId": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "users": rows }))
}

fn users_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = get_required_str(params, "email")?;
    let role = validate_role(&get_required_str(params, "role")?)?;
    let department_id = get_opt_str(params, "departmentId");
    if !email.contains('@') {
        return Err(HandlerErr::new("bad_params", "email is malformed"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, name, email, role, department_id) VALUES(?, ?, ?, ?, ?)",
        (&id, name.trim(), email.trim(), &role, &department_id),
    )
    .map_err(db_update)?;
    Ok(json!({ "userId": id }))
}

fn users_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "userId")?;
    let name = get_required_str(params, "name")?;
    let role = validate_role(&get_required_str(params, "role")?)?;
    let department_id = get_opt_str(params, "departmentId");
    let changed = conn
        .execute(
            "UPDATE users SET name = ?, role = ?, department_id = ? WHERE id = ?",
            (name.trim(), &role, &department_id, &id),
        )
        .map_err(db_update)?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "user not found"));
    }
    Ok(json!({ "ok": true }))
}

fn users_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "userId")?;
    let changed = conn
        .execute("DELETE FROM users WHERE id = ?", [&id])
        .map_err(db_update)?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "user not found"));
    }
    Ok(json!({ "ok": true }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match role_claim(req) {
        Ok(role) if role.is_admin() => {}
        Ok(_) => return err(&req.id, "forbidden", "admin role required", None),
        Err(e) => return e.response(&req.id),
    }
    let result = match req.method.as_str() {
        "users.list" => users_list(conn),
        "users.create" => users_create(conn, &req.params),
        "users.update" => users_update(conn, &req.params),
        "users.delete" => users_delete(conn, &req.params),
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
        "users.list" | "users.create" | "users.update" | "users.delete" => {
            Some(dispatch(state, req))
        }
        _ => None,
    }
}
