use rusqlite::Connection;
use serde_json::{json, Value};

use crate::calc;
use crate::ipc::handlers::invitations::resolve_code;
use crate::ipc::helpers::{
    db_write, get_opt_str, get_required_str, require_parent, run, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Exam, GradeRecord, SchoolClass, Student, User};
use crate::store;

/// A student bound to the calling parent.
pub fn bound_child(conn: &Connection, parent: &User, student_id: &str) -> Result<Student, HandlerErr> {
    if !parent.child_ids.iter().any(|c| c == student_id) {
        return Err(HandlerErr::forbidden("student is not bound to this account"));
    }
    store::student_by_id(conn, student_id)?.ok_or_else(|| HandlerErr::not_found("student"))
}

fn describe_student(conn: &Connection, student: &Student) -> Result<Value, HandlerErr> {
    let school = store::school_by_id(conn, &student.school_id)?;
    let classes: Vec<SchoolClass> = store::get(conn, &student.school_id)?;
    let class_name = classes
        .iter()
        .find(|c| c.id == student.class_id)
        .map(|c| c.name.clone());
    Ok(json!({
        "student": to_json(student)?,
        "schoolName": school.map(|s| s.name),
        "className": class_name,
    }))
}

fn parents_children(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let parent = require_parent(conn, params)?;
    let mut children = Vec::with_capacity(parent.child_ids.len());
    for id in &parent.child_ids {
        if let Some(student) = store::student_by_id(conn, id)? {
            children.push(describe_student(conn, &student)?);
        }
    }
    Ok(json!({ "children": children }))
}

/// Locates a child by exact name inside a class, scoped by an invite code or
/// an explicit school and grade.
fn parents_find_student(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let parent = require_parent(conn, params)?;
    let (school_id, grade_id) = match get_opt_str(params, "inviteCode")? {
        Some(code) => {
            let inv = resolve_code(conn, &code)?;
            (inv.school_id, inv.grade_id)
        }
        None => (
            get_required_str(params, "schoolId")?,
            get_required_str(params, "gradeId")?,
        ),
    };
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?;

    let students: Vec<Student> = store::get(conn, &school_id)?;
    let found = students
        .into_iter()
        .find(|s| s.name == name && s.grade_id == grade_id && s.class_id == class_id)
        .ok_or_else(|| {
            HandlerErr::not_found("student").with_details(json!({ "classId": class_id }))
        })?;
    if parent.child_ids.contains(&found.id) {
        return Err(HandlerErr::conflict("student is already bound to this account")
            .with_details(json!({ "studentId": found.id })));
    }
    describe_student(conn, &found)
}

fn parents_bind(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut parent = require_parent(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let student =
        store::student_by_id(conn, &student_id)?.ok_or_else(|| HandlerErr::not_found("student"))?;

    let already = parent.child_ids.contains(&student.id);
    if !already {
        parent.child_ids.push(student.id.clone());
        store::upsert_user(conn, &parent).map_err(db_write("db_update_failed"))?;
        tracing::info!(parent_id = %parent.id, student_id = %student.id, "child bound");
    }
    Ok(json!({ "user": to_json(&parent)?, "alreadyBound": already }))
}

fn parents_child_grades(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let parent = require_parent(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let student = bound_child(conn, &parent, &student_id)?;

    let exams: Vec<Exam> = store::get(conn, &student.school_id)?;
    let records: Vec<GradeRecord> = store::get::<GradeRecord>(conn, &student.school_id)?
        .into_iter()
        .filter(|r| r.student_id == student.id)
        .collect();
    let rows: Vec<Value> = records
        .iter()
        .map(|r| {
            let exam = exams.iter().find(|e| e.id == r.exam_id);
            json!({
                "record": r,
                "examName": exam.map(|e| e.name.as_str()),
                "examDate": exam.map(|e| e.date.as_str()),
                "total": r.total(),
            })
        })
        .collect();

    Ok(json!({
        "student": to_json(&student)?,
        "records": rows,
        "trend": to_json(&calc::trend_points(&records, &exams))?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "parents.children" => Some(run(state, req, parents_children)),
        "parents.findStudent" => Some(run(state, req, parents_find_student)),
        "parents.bind" => Some(run(state, req, parents_bind)),
        "parents.childGrades" => Some(run(state, req, parents_child_grades)),
        _ => None,
    }
}
