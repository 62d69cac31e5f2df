use rusqlite::Connection;
use serde_json::{json, Value};

use crate::ipc::helpers::{
    db_write, get_opt_str, get_required_str, require_actor, require_admin, run, to_json,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store;

/// Public directory used by parents to locate a school.
fn schools_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let schools: Vec<Value> = store::schools(conn)?
        .into_iter()
        .map(|s| json!({ "id": s.id, "name": s.name }))
        .collect();
    Ok(json!({ "schools": schools }))
}

fn schools_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let actor = require_actor(conn, params)?;
    let school_id = match get_opt_str(params, "schoolId")? {
        Some(id) => id,
        None => actor
            .school_id
            .clone()
            .ok_or_else(|| HandlerErr::bad_params("missing schoolId"))?,
    };
    let school = store::school_by_id(conn, &school_id)?
        .ok_or_else(|| HandlerErr::not_found("school"))?;
    Ok(json!({ "school": to_json(&school)? }))
}

fn schools_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let mut school = store::school_by_id(conn, &school_id)?
        .ok_or_else(|| HandlerErr::not_found("school"))?;

    if params.get("name").is_some() {
        school.name = get_required_str(params, "name")?;
    }
    // Present keys overwrite; null or blank clears.
    let fields: [(&str, &mut Option<String>); 5] = [
        ("logo", &mut school.logo),
        ("motto", &mut school.motto),
        ("address", &mut school.address),
        ("phone", &mut school.phone),
        ("website", &mut school.website),
    ];
    for (key, slot) in fields {
        if params.get(key).is_some() {
            *slot = get_opt_str(params, key)?;
        }
    }

    store::upsert_school(conn, &school).map_err(db_write("db_update_failed"))?;
    Ok(json!({ "school": to_json(&school)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.list" => Some(run(state, req, schools_list)),
        "schools.get" => Some(run(state, req, schools_get)),
        "schools.update" => Some(run(state, req, schools_update)),
        _ => None,
    }
}
