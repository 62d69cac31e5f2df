use rusqlite::Connection;
use serde_json::{json, Value};

use crate::ipc::helpers::{
    begin, commit, db_write, get_required_str, new_id, require_admin, require_school_role, run,
    to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{GradeLevel, Role, SchoolClass};
use crate::store;

fn grade_levels_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_school_role(conn, params, &[Role::Admin, Role::Teacher])?;
    let grades: Vec<GradeLevel> = store::get(conn, &school_id)?;
    Ok(json!({ "gradeLevels": to_json(&grades)? }))
}

fn ensure_name_free(grades: &[GradeLevel], name: &str, except_id: Option<&str>) -> Result<(), HandlerErr> {
    if grades
        .iter()
        .any(|g| g.name == name && Some(g.id.as_str()) != except_id)
    {
        return Err(HandlerErr::conflict(format!("grade level {} already exists", name)));
    }
    Ok(())
}

fn grade_levels_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let name = get_required_str(params, "name")?;

    let mut grades: Vec<GradeLevel> = store::get(conn, &school_id)?;
    ensure_name_free(&grades, &name, None)?;
    let grade = GradeLevel {
        id: new_id(),
        school_id: school_id.clone(),
        name,
    };
    grades.push(grade.clone());

    store::save(conn, &school_id, &grades).map_err(db_write("db_insert_failed"))?;
    Ok(json!({ "gradeLevel": to_json(&grade)? }))
}

fn grade_levels_rename(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let grade_id = get_required_str(params, "gradeId")?;
    let name = get_required_str(params, "name")?;

    let mut grades: Vec<GradeLevel> = store::get(conn, &school_id)?;
    ensure_name_free(&grades, &name, Some(&grade_id))?;
    let grade = grades
        .iter_mut()
        .find(|g| g.id == grade_id)
        .ok_or_else(|| HandlerErr::not_found("grade level"))?;
    grade.name = name;
    let updated = grade.clone();

    store::save(conn, &school_id, &grades).map_err(db_write("db_update_failed"))?;
    Ok(json!({ "gradeLevel": to_json(&updated)? }))
}

fn grade_levels_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let grade_id = get_required_str(params, "gradeId")?;

    let mut grades: Vec<GradeLevel> = store::get(conn, &school_id)?;
    let before = grades.len();
    grades.retain(|g| g.id != grade_id);
    if grades.len() == before {
        return Err(HandlerErr::not_found("grade level"));
    }
    let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let class_count = classes.iter().filter(|c| c.grade_id == grade_id).count();
    if class_count > 0 {
        return Err(HandlerErr::conflict("grade level still has classes")
            .with_details(json!({ "classCount": class_count })));
    }

    // Removing the grade also drops its invitations.
    let tx = begin(conn)?;
    store::save(&tx, &school_id, &grades).map_err(db_write("db_delete_failed"))?;
    commit(tx)?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradeLevels.list" => Some(run(state, req, grade_levels_list)),
        "gradeLevels.create" => Some(run(state, req, grade_levels_create)),
        "gradeLevels.rename" => Some(run(state, req, grade_levels_rename)),
        "gradeLevels.delete" => Some(run(state, req, grade_levels_delete)),
        _ => None,
    }
}
