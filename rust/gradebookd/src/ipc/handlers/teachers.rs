use rusqlite::Connection;
use serde_json::{json, Value};

use crate::auth::hash_password;
use crate::ipc::helpers::{
    begin, commit, db_write, get_opt_str, get_required_str, get_string_array, matches_query,
    new_id, require_admin, require_staff, run, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Gender, Role, SchoolClass, User};
use crate::store;

fn parse_gender(params: &Value) -> Result<Option<Gender>, HandlerErr> {
    match get_opt_str(params, "gender")? {
        None => Ok(None),
        Some(g) => Gender::parse(&g)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown gender {}", g))),
    }
}

fn school_teachers(conn: &Connection, school_id: &str) -> Result<Vec<User>, HandlerErr> {
    Ok(store::users(conn)?
        .into_iter()
        .filter(|u| u.role == Role::Teacher && u.school_id.as_deref() == Some(school_id))
        .collect())
}

fn teacher_of_school(conn: &Connection, school_id: &str, teacher_id: &str) -> Result<User, HandlerErr> {
    store::user_by_id(conn, teacher_id)?
        .filter(|u| u.role == Role::Teacher && u.school_id.as_deref() == Some(school_id))
        .ok_or_else(|| HandlerErr::not_found("teacher"))
}

fn teachers_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let query = get_opt_str(params, "query")?;
    let teachers: Vec<User> = school_teachers(conn, &school_id)?
        .into_iter()
        .filter(|t| {
            let name = t.real_name.as_deref().unwrap_or(&t.username);
            matches_query(query.as_deref(), name, &t.username)
        })
        .collect();
    Ok(json!({ "teachers": to_json(&teachers)? }))
}

fn teachers_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let username = get_required_str(params, "username")?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    let real_name = get_required_str(params, "realName")?;
    let gender = parse_gender(params)?;
    let subjects = get_string_array(params, "subjects")?.unwrap_or_default();

    if store::user_by_username(conn, &username)?.is_some() {
        return Err(HandlerErr::conflict("username already exists"));
    }
    let password_hash =
        hash_password(password).map_err(|e| HandlerErr::new("internal", e.to_string()))?;

    let teacher = User {
        id: new_id(),
        username,
        password_hash,
        role: Role::Teacher,
        school_id: Some(school_id),
        child_ids: Vec::new(),
        real_name: Some(real_name),
        gender,
        subjects,
    };
    store::upsert_user(conn, &teacher).map_err(db_write("db_insert_failed"))?;
    Ok(json!({ "teacher": to_json(&teacher)? }))
}

fn teachers_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let mut teacher = teacher_of_school(conn, &school_id, &teacher_id)?;

    if params.get("realName").is_some() {
        teacher.real_name = Some(get_required_str(params, "realName")?);
    }
    if params.get("gender").is_some() {
        teacher.gender = parse_gender(params)?;
    }
    if let Some(subjects) = get_string_array(params, "subjects")? {
        teacher.subjects = subjects;
    }
    if let Some(password) = params
        .get("password")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        teacher.password_hash =
            hash_password(password).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    }

    store::upsert_user(conn, &teacher).map_err(db_write("db_update_failed"))?;
    Ok(json!({ "teacher": to_json(&teacher)? }))
}

fn teachers_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let teacher_id = get_required_str(params, "teacherId")?;
    teacher_of_school(conn, &school_id, &teacher_id)?;

    let mut classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let mut cleared = 0usize;
    for c in classes.iter_mut() {
        let was_assigned = c.is_taught_by(&teacher_id);
        if c.class_teacher_id.as_deref() == Some(teacher_id.as_str()) {
            c.class_teacher_id = None;
        }
        c.subject_teachers.retain(|_, t| *t != teacher_id);
        if was_assigned {
            cleared += 1;
        }
    }

    let tx = begin(conn)?;
    store::save(&tx, &school_id, &classes).map_err(db_write("db_update_failed"))?;
    store::delete_user(&tx, &teacher_id).map_err(db_write("db_delete_failed"))?;
    commit(tx)?;
    Ok(json!({ "deleted": true, "classesCleared": cleared }))
}

/// Classes a teacher teaches. Admins may name any teacher; teachers get their own.
fn teachers_classes(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (actor, school_id) = require_staff(conn, params)?;
    let teacher_id = match actor.role {
        Role::Admin => get_required_str(params, "teacherId")?,
        _ => actor.id.clone(),
    };
    let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let taught: Vec<Value> = classes
        .iter()
        .filter(|c| c.is_taught_by(&teacher_id))
        .map(|c| {
            let subjects: Vec<&String> = c
                .subject_teachers
                .iter()
                .filter(|(_, t)| **t == teacher_id)
                .map(|(s, _)| s)
                .collect();
            json!({
                "class": c,
                "isClassTeacher": c.class_teacher_id.as_deref() == Some(teacher_id.as_str()),
                "subjects": subjects,
            })
        })
        .collect();
    Ok(json!({ "classes": taught }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(run(state, req, teachers_list)),
        "teachers.create" => Some(run(state, req, teachers_create)),
        "teachers.update" => Some(run(state, req, teachers_update)),
        "teachers.delete" => Some(run(state, req, teachers_delete)),
        "teachers.classes" => Some(run(state, req, teachers_classes)),
        _ => None,
    }
}
