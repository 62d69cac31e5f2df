use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::{json, Value};

use crate::calc;
use crate::ipc::helpers::{
    begin, class_visible, commit, db_write, find_by_id, get_opt_str, get_required_str, new_id,
    require_admin, require_staff, run, to_json, visible_class_ids, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Exam, GradeRecord, SchoolClass, Semester, Student};
use crate::store;

/// `YYYY-MM-DD`, defaulting to today.
pub fn exam_date(params: &Value, key: &str) -> Result<String, HandlerErr> {
    match get_opt_str(params, key)? {
        None => Ok(chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()),
        Some(d) => NaiveDate::parse_from_str(&d, "%Y-%m-%d")
            .map(|nd| nd.format("%Y-%m-%d").to_string())
            .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))),
    }
}

fn exams_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_staff(conn, params)?;
    let semester_id = get_opt_str(params, "semesterId")?;
    let query = get_opt_str(params, "query")?.map(|q| q.to_lowercase());

    let mut exams: Vec<Exam> = store::get(conn, &school_id)?;
    exams.retain(|e| semester_id.as_deref().map_or(true, |s| e.semester_id == s));
    exams.retain(|e| {
        query
            .as_deref()
            .map_or(true, |q| e.name.to_lowercase().contains(q))
    });
    // Newest first; stable for equal dates.
    exams.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(json!({ "exams": to_json(&exams)? }))
}

fn exams_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let name = get_required_str(params, "name")?;
    let semester_id = get_required_str(params, "semesterId")?;
    let date = exam_date(params, "date")?;

    let semesters: Vec<Semester> = store::get(conn, &school_id)?;
    find_by_id(&semesters, &semester_id, |s| s.id.as_str(), "semester")?;

    let mut exams: Vec<Exam> = store::get(conn, &school_id)?;
    let exam = Exam {
        id: new_id(),
        school_id: school_id.clone(),
        semester_id,
        name,
        date,
    };
    exams.push(exam.clone());
    store::save(conn, &school_id, &exams).map_err(db_write("db_insert_failed"))?;
    Ok(json!({ "exam": to_json(&exam)? }))
}

fn exams_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let exam_id = get_required_str(params, "examId")?;

    let mut exams: Vec<Exam> = store::get(conn, &school_id)?;
    let before = exams.len();
    exams.retain(|e| e.id != exam_id);
    if exams.len() == before {
        return Err(HandlerErr::not_found("exam"));
    }
    let records: Vec<GradeRecord> = store::get(conn, &school_id)?;
    let removed_records = records.iter().filter(|r| r.exam_id == exam_id).count();

    // Exam removal cascades to its grade records.
    let tx = begin(conn)?;
    store::save(&tx, &school_id, &exams).map_err(db_write("db_delete_failed"))?;
    commit(tx)?;
    tracing::info!(exam_id = %exam_id, removed_records, "exam deleted");
    Ok(json!({ "deleted": true, "removedRecords": removed_records }))
}

fn exams_stats(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (actor, school_id) = require_staff(conn, params)?;
    let exam_id = get_required_str(params, "examId")?;

    let exams: Vec<Exam> = store::get(conn, &school_id)?;
    find_by_id(&exams, &exam_id, |e| e.id.as_str(), "exam")?;

    let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let visible = visible_class_ids(&classes, &actor);
    let students: Vec<Student> = store::get(conn, &school_id)?;
    let records: Vec<GradeRecord> = store::get(conn, &school_id)?;
    let in_scope: Vec<&GradeRecord> = records
        .iter()
        .filter(|r| r.exam_id == exam_id)
        .filter(|r| {
            visible.is_none()
                || students
                    .iter()
                    .find(|s| s.id == r.student_id)
                    .map_or(false, |s| class_visible(&visible, &s.class_id))
        })
        .collect();

    let stats = calc::exam_stats(in_scope.iter().copied());
    Ok(json!({
        "examId": exam_id,
        "studentCount": in_scope.len(),
        "subjects": to_json(&stats)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.list" => Some(run(state, req, exams_list)),
        "exams.create" => Some(run(state, req, exams_create)),
        "exams.delete" => Some(run(state, req, exams_delete)),
        "exams.stats" => Some(run(state, req, exams_stats)),
        _ => None,
    }
}
