use rusqlite::Connection;
use serde_json::{json, Value};

use crate::ipc::helpers::{
    begin, class_visible, commit, db_write, find_by_id, get_opt_str, get_required_str,
    matches_query, new_id, require_admin, require_staff, run, to_json, visible_class_ids,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Role, SchoolClass, Student, User};
use crate::store;

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (actor, school_id) = require_staff(conn, params)?;
    let grade_id = get_opt_str(params, "gradeId")?;
    let class_id = get_opt_str(params, "classId")?;
    let query = get_opt_str(params, "query")?;

    let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let visible = visible_class_ids(&classes, &actor);
    let students: Vec<Student> = store::get(conn, &school_id)?;
    let students: Vec<&Student> = students
        .iter()
        .filter(|s| class_visible(&visible, &s.class_id))
        .filter(|s| grade_id.as_deref().map_or(true, |g| s.grade_id == g))
        .filter(|s| class_id.as_deref().map_or(true, |c| s.class_id == c))
        .filter(|s| matches_query(query.as_deref(), &s.name, &s.student_no))
        .collect();
    Ok(json!({ "students": to_json(&students)? }))
}

fn ensure_number_free(students: &[Student], number: &str, except_id: Option<&str>) -> Result<(), HandlerErr> {
    if students
        .iter()
        .any(|s| s.student_no == number && Some(s.id.as_str()) != except_id)
    {
        return Err(HandlerErr::conflict(format!(
            "student number {} already exists",
            number
        )));
    }
    Ok(())
}

fn students_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let name = get_required_str(params, "name")?;
    let student_no = get_required_str(params, "studentNo")?;
    let class_id = get_required_str(params, "classId")?;

    let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let class = find_by_id(&classes, &class_id, |c| c.id.as_str(), "class")?;
    let mut students: Vec<Student> = store::get(conn, &school_id)?;
    ensure_number_free(&students, &student_no, None)?;

    let student = Student {
        id: new_id(),
        school_id: school_id.clone(),
        grade_id: class.grade_id.clone(),
        class_id,
        name,
        student_no,
    };
    students.push(student.clone());
    store::save(conn, &school_id, &students).map_err(db_write("db_insert_failed"))?;
    Ok(json!({ "student": to_json(&student)? }))
}

fn students_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;

    let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let mut students: Vec<Student> = store::get(conn, &school_id)?;
    let mut student = find_by_id(&students, &student_id, |s| s.id.as_str(), "student")?.clone();

    if params.get("name").is_some() {
        student.name = get_required_str(params, "name")?;
    }
    if params.get("studentNo").is_some() {
        student.student_no = get_required_str(params, "studentNo")?;
        ensure_number_free(&students, &student.student_no, Some(&student.id))?;
    }
    if let Some(class_id) = get_opt_str(params, "classId")? {
        let class = find_by_id(&classes, &class_id, |c| c.id.as_str(), "class")?;
        student.grade_id = class.grade_id.clone();
        student.class_id = class_id;
    }

    for s in students.iter_mut().filter(|s| s.id == student.id) {
        *s = student.clone();
    }
    store::save(conn, &school_id, &students).map_err(db_write("db_update_failed"))?;
    Ok(json!({ "student": to_json(&student)? }))
}

fn students_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;

    let mut students: Vec<Student> = store::get(conn, &school_id)?;
    let before = students.len();
    students.retain(|s| s.id != student_id);
    if students.len() == before {
        return Err(HandlerErr::not_found("student"));
    }

    // Grade records and parent links go with the student.
    let tx = begin(conn)?;
    store::save(&tx, &school_id, &students).map_err(db_write("db_delete_failed"))?;
    commit(tx)?;
    Ok(json!({ "deleted": true }))
}

fn student_in_school(conn: &Connection, school_id: &str, student_id: &str) -> Result<Student, HandlerErr> {
    let students: Vec<Student> = store::get(conn, school_id)?;
    students
        .into_iter()
        .find(|s| s.id == student_id)
        .ok_or_else(|| HandlerErr::not_found("student"))
}

fn parents_of(conn: &Connection, student_id: &str) -> Result<Vec<User>, HandlerErr> {
    Ok(store::users(conn)?
        .into_iter()
        .filter(|u| u.role == Role::Parent && u.child_ids.iter().any(|c| c == student_id))
        .collect())
}

fn students_parents_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    student_in_school(conn, &school_id, &student_id)?;
    Ok(json!({ "parents": to_json(&parents_of(conn, &student_id)?)? }))
}

fn students_parents_link(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let parent_key = get_required_str(params, "parent")?;
    student_in_school(conn, &school_id, &student_id)?;

    let parent = match store::user_by_id(conn, &parent_key)? {
        Some(u) => Some(u),
        None => store::user_by_username(conn, &parent_key)?,
    };
    let mut parent = parent.ok_or_else(|| HandlerErr::not_found("parent account"))?;
    if parent.role != Role::Parent {
        return Err(HandlerErr::bad_params(format!(
            "{} is not a parent account",
            parent.username
        )));
    }
    let already = parent.child_ids.contains(&student_id);
    if !already {
        parent.child_ids.push(student_id);
        store::upsert_user(conn, &parent).map_err(db_write("db_update_failed"))?;
    }
    Ok(json!({ "parent": to_json(&parent)?, "alreadyLinked": already }))
}

fn students_parents_unlink(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let parent_id = get_required_str(params, "parentId")?;
    student_in_school(conn, &school_id, &student_id)?;

    let mut parent = store::user_by_id(conn, &parent_id)?
        .filter(|u| u.role == Role::Parent)
        .ok_or_else(|| HandlerErr::not_found("parent account"))?;
    let before = parent.child_ids.len();
    parent.child_ids.retain(|c| *c != student_id);
    if parent.child_ids.len() != before {
        store::upsert_user(conn, &parent).map_err(db_write("db_update_failed"))?;
    }
    Ok(json!({ "unlinked": parent.child_ids.len() != before }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(run(state, req, students_list)),
        "students.create" => Some(run(state, req, students_create)),
        "students.update" => Some(run(state, req, students_update)),
        "students.delete" => Some(run(state, req, students_delete)),
        "students.parents.list" => Some(run(state, req, students_parents_list)),
        "students.parents.link" => Some(run(state, req, students_parents_link)),
        "students.parents.unlink" => Some(run(state, req, students_parents_unlink)),
        _ => None,
    }
}
