use rusqlite::Connection;
use serde_json::{json, Value};

use crate::auth::{hash_password, verify_password};
use crate::ipc::helpers::{
    begin, commit, db_write, get_opt_str, get_required_str, new_id, run, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Role, School, User};
use crate::store;

/// Passwords are taken verbatim; only emptiness is rejected.
fn get_password(params: &Value) -> Result<String, HandlerErr> {
    params
        .get("password")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))
}

fn session(conn: &Connection, user: &User) -> Result<Value, HandlerErr> {
    let school = match user.school_id.as_deref() {
        Some(id) => store::school_by_id(conn, id)?,
        None => None,
    };
    Ok(json!({ "user": to_json(user)?, "school": to_json(&school)? }))
}

fn register(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_password(params)?;
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown role {}", role_raw)))?;
    if role == Role::Teacher {
        return Err(HandlerErr::forbidden(
            "teacher accounts are created by a school administrator",
        ));
    }
    let school_name = get_opt_str(params, "schoolName")?;
    if role == Role::Admin && school_name.is_none() {
        return Err(HandlerErr::bad_params("schoolName is required for ADMIN"));
    }
    if store::user_by_username(conn, &username)?.is_some() {
        return Err(HandlerErr::conflict("username already exists"));
    }

    let password_hash =
        hash_password(&password).map_err(|e| HandlerErr::new("internal", e.to_string()))?;

    let tx = begin(conn)?;
    let school_id = match (role, school_name) {
        (Role::Admin, Some(name)) => {
            let school = School {
                id: new_id(),
                name,
                logo: None,
                motto: None,
                address: None,
                phone: None,
                website: None,
            };
            store::upsert_school(&tx, &school).map_err(db_write("db_insert_failed"))?;
            Some(school.id)
        }
        _ => None,
    };
    let user = User {
        id: new_id(),
        username,
        password_hash,
        role,
        school_id,
        child_ids: Vec::new(),
        real_name: None,
        gender: None,
        subjects: Vec::new(),
    };
    store::upsert_user(&tx, &user).map_err(db_write("db_insert_failed"))?;
    commit(tx)?;

    tracing::info!(user_id = %user.id, role = user.role.as_str(), "account registered");
    session(conn, &user)
}

fn login(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_password(params)?;
    let invalid = || HandlerErr::new("invalid_credentials", "wrong username or password");

    let user = store::user_by_username(conn, &username)?.ok_or_else(invalid)?;
    let matches = verify_password(&password, &user.password_hash).map_err(|e| {
        tracing::warn!(user_id = %user.id, error = %e, "stored password hash unreadable");
        invalid()
    })?;
    if !matches {
        return Err(invalid());
    }
    session(conn, &user)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.register" => Some(run(state, req, register)),
        "auth.login" => Some(run(state, req, login)),
        _ => None,
    }
}
