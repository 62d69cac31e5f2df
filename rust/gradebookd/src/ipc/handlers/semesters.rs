use rusqlite::Connection;
use serde_json::{json, Value};

use crate::ipc::helpers::{
    begin, commit, db_write, get_required_str, new_id, require_admin, require_school_role, run,
    to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Exam, Role, Semester};
use crate::store;

const ANY_MEMBER: &[Role] = &[Role::Admin, Role::Teacher];

fn semesters_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_school_role(conn, params, ANY_MEMBER)?;
    let semesters: Vec<Semester> = store::get(conn, &school_id)?;
    Ok(json!({ "semesters": to_json(&semesters)? }))
}

fn semesters_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let name = get_required_str(params, "name")?;

    let mut semesters: Vec<Semester> = store::get(conn, &school_id)?;
    let semester = Semester {
        id: new_id(),
        school_id: school_id.clone(),
        name,
        is_current: semesters.is_empty(),
    };
    semesters.push(semester.clone());

    let tx = begin(conn)?;
    store::save(&tx, &school_id, &semesters).map_err(db_write("db_insert_failed"))?;
    commit(tx)?;
    Ok(json!({ "semester": to_json(&semester)? }))
}

fn semesters_rename(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let semester_id = get_required_str(params, "semesterId")?;
    let name = get_required_str(params, "name")?;

    let mut semesters: Vec<Semester> = store::get(conn, &school_id)?;
    let semester = semesters
        .iter_mut()
        .find(|s| s.id == semester_id)
        .ok_or_else(|| HandlerErr::not_found("semester"))?;
    semester.name = name;
    let updated = semester.clone();

    store::save(conn, &school_id, &semesters).map_err(db_write("db_update_failed"))?;
    Ok(json!({ "semester": to_json(&updated)? }))
}

fn semesters_set_current(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let semester_id = get_required_str(params, "semesterId")?;

    let mut semesters: Vec<Semester> = store::get(conn, &school_id)?;
    if !semesters.iter().any(|s| s.id == semester_id) {
        return Err(HandlerErr::not_found("semester"));
    }
    for s in semesters.iter_mut() {
        s.is_current = s.id == semester_id;
    }

    let tx = begin(conn)?;
    store::save(&tx, &school_id, &semesters).map_err(db_write("db_update_failed"))?;
    commit(tx)?;
    Ok(json!({ "semesters": to_json(&semesters)? }))
}

fn semesters_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let semester_id = get_required_str(params, "semesterId")?;

    let mut semesters: Vec<Semester> = store::get(conn, &school_id)?;
    let before = semesters.len();
    semesters.retain(|s| s.id != semester_id);
    if semesters.len() == before {
        return Err(HandlerErr::not_found("semester"));
    }
    let exams: Vec<Exam> = store::get(conn, &school_id)?;
    let exam_count = exams.iter().filter(|e| e.semester_id == semester_id).count();
    if exam_count > 0 {
        return Err(HandlerErr::conflict("semester still has exams")
            .with_details(json!({ "examCount": exam_count })));
    }

    let tx = begin(conn)?;
    store::save(&tx, &school_id, &semesters).map_err(db_write("db_delete_failed"))?;
    commit(tx)?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "semesters.list" => Some(run(state, req, semesters_list)),
        "semesters.create" => Some(run(state, req, semesters_create)),
        "semesters.rename" => Some(run(state, req, semesters_rename)),
        "semesters.setCurrent" => Some(run(state, req, semesters_set_current)),
        "semesters.delete" => Some(run(state, req, semesters_delete)),
        _ => None,
    }
}
