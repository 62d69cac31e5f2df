use std::collections::BTreeMap;

use rusqlite::Connection;
use serde_json::{json, Value};

use crate::ipc::helpers::{
    begin, commit, db_write, find_by_id, get_opt_str, get_required_str, new_id, require_admin, require_staff,
    run, to_json, visible_class_ids, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{GradeLevel, Role, SchoolClass, Student};
use crate::store;

fn ensure_teacher(conn: &Connection, school_id: &str, teacher_id: &str) -> Result<(), HandlerErr> {
    match store::user_by_id(conn, teacher_id)? {
        Some(u) if u.role == Role::Teacher && u.school_id.as_deref() == Some(school_id) => Ok(()),
        _ => Err(HandlerErr::bad_params(format!(
            "{} is not a teacher of this school",
            teacher_id
        ))),
    }
}

fn parse_subject_teachers(
    conn: &Connection,
    school_id: &str,
    params: &Value,
) -> Result<Option<BTreeMap<String, String>>, HandlerErr> {
    let obj = match params.get("subjectTeachers") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(obj)) => obj,
        Some(_) => return Err(HandlerErr::bad_params("subjectTeachers must be an object")),
    };
    let mut out = BTreeMap::new();
    for (subject, teacher) in obj {
        let subject = subject.trim();
        let Some(teacher_id) = teacher.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            // Null or blank unassigns the subject.
            continue;
        };
        if subject.is_empty() {
            return Err(HandlerErr::bad_params("subjectTeachers has a blank subject"));
        }
        ensure_teacher(conn, school_id, teacher_id)?;
        out.insert(subject.to_string(), teacher_id.to_string());
    }
    Ok(Some(out))
}

fn ensure_name_free(classes: &[SchoolClass], grade_id: &str, name: &str, except_id: Option<&str>) -> Result<(), HandlerErr> {
    if classes
        .iter()
        .any(|c| c.grade_id == grade_id && c.name == name && Some(c.id.as_str()) != except_id)
    {
        return Err(HandlerErr::conflict(format!(
            "class {} already exists in this grade",
            name
        )));
    }
    Ok(())
}

fn classes_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (actor, school_id) = require_staff(conn, params)?;
    let grade_id = get_opt_str(params, "gradeId")?;

    let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let visible = visible_class_ids(&classes, &actor);
    let classes: Vec<&SchoolClass> = classes
        .iter()
        .filter(|c| visible.as_ref().map_or(true, |ids| ids.contains(&c.id)))
        .filter(|c| grade_id.as_deref().map_or(true, |g| c.grade_id == g))
        .collect();
    Ok(json!({ "classes": to_json(&classes)? }))
}

fn classes_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let grade_id = get_required_str(params, "gradeId")?;
    let name = get_required_str(params, "name")?;

    let grades: Vec<GradeLevel> = store::get(conn, &school_id)?;
    find_by_id(&grades, &grade_id, |g| g.id.as_str(), "grade level")?;
    let mut classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    ensure_name_free(&classes, &grade_id, &name, None)?;

    let class_teacher_id = get_opt_str(params, "classTeacherId")?;
    if let Some(t) = class_teacher_id.as_deref() {
        ensure_teacher(conn, &school_id, t)?;
    }
    let subject_teachers = parse_subject_teachers(conn, &school_id, params)?.unwrap_or_default();

    let class = SchoolClass {
        id: new_id(),
        school_id: school_id.clone(),
        grade_id,
        name,
        class_teacher_id,
        subject_teachers,
    };
    classes.push(class.clone());
    store::save(conn, &school_id, &classes).map_err(db_write("db_insert_failed"))?;
    Ok(json!({ "class": to_json(&class)? }))
}

fn classes_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let class_id = get_required_str(params, "classId")?;

    let grades: Vec<GradeLevel> = store::get(conn, &school_id)?;
    let mut classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let mut class = find_by_id(&classes, &class_id, |c| c.id.as_str(), "class")?.clone();

    if params.get("name").is_some() {
        class.name = get_required_str(params, "name")?;
    }
    let grade_changed = match get_opt_str(params, "gradeId")? {
        Some(g) if g != class.grade_id => {
            find_by_id(&grades, &g, |x| x.id.as_str(), "grade level")?;
            class.grade_id = g;
            true
        }
        _ => false,
    };
    if params.get("classTeacherId").is_some() {
        class.class_teacher_id = get_opt_str(params, "classTeacherId")?;
        if let Some(t) = class.class_teacher_id.as_deref() {
            ensure_teacher(conn, &school_id, t)?;
        }
    }
    if let Some(st) = parse_subject_teachers(conn, &school_id, params)? {
        class.subject_teachers = st;
    }
    ensure_name_free(&classes, &class.grade_id, &class.name, Some(&class.id))?;

    // Students follow their class into the new grade.
    let mut students: Vec<Student> = store::get(conn, &school_id)?;
    if grade_changed {
        for s in students.iter_mut().filter(|s| s.class_id == class.id) {
            s.grade_id = class.grade_id.clone();
        }
    }

    for c in classes.iter_mut().filter(|c| c.id == class.id) {
        *c = class.clone();
    }
    let tx = begin(conn)?;
    store::save(&tx, &school_id, &classes).map_err(db_write("db_update_failed"))?;
    if grade_changed {
        store::save(&tx, &school_id, &students).map_err(db_write("db_update_failed"))?;
    }
    commit(tx)?;
    Ok(json!({ "class": to_json(&class)? }))
}

fn classes_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let class_id = get_required_str(params, "classId")?;

    let mut classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let before = classes.len();
    classes.retain(|c| c.id != class_id);
    if classes.len() == before {
        return Err(HandlerErr::not_found("class"));
    }
    let students: Vec<Student> = store::get(conn, &school_id)?;
    let student_count = students.iter().filter(|s| s.class_id == class_id).count();
    if student_count > 0 {
        return Err(HandlerErr::conflict("class still has students")
            .with_details(json!({ "studentCount": student_count })));
    }

    store::save(conn, &school_id, &classes).map_err(db_write("db_delete_failed"))?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(run(state, req, classes_list)),
        "classes.create" => Some(run(state, req, classes_create)),
        "classes.update" => Some(run(state, req, classes_update)),
        "classes.delete" => Some(run(state, req, classes_delete)),
        _ => None,
    }
}
