use std::collections::HashSet;

use rusqlite::Connection;
use serde_json::{json, Value};

use crate::ipc::helpers::{
    begin, class_visible, commit, db_write, find_by_id, get_opt_str, get_required_str,
    matches_query, new_id, require_staff, run, to_json, visible_class_ids, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Exam, GradeRecord, SchoolClass, Student, SubjectGrade};
use crate::reconcile::FULL_SCORE;
use crate::store;

fn parse_score(v: Option<&Value>, key: &str) -> Result<f64, HandlerErr> {
    v.and_then(|v| v.as_f64())
        .filter(|x| x.is_finite() && *x >= 0.0)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-negative number", key)))
}

fn check_range(score: f64, full_score: f64, subject: &str) -> Result<(), HandlerErr> {
    if score > full_score {
        return Err(HandlerErr::bad_params(format!(
            "{} score {} exceeds full score {}",
            subject, score, full_score
        ))
        .with_details(json!({ "subject": subject, "score": score, "fullScore": full_score })));
    }
    Ok(())
}

fn parse_grades(params: &Value) -> Result<Vec<SubjectGrade>, HandlerErr> {
    let items = params
        .get("grades")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("grades must be an array"))?;
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let subject = get_required_str(item, "subject")?;
        if !seen.insert(subject.clone()) {
            return Err(HandlerErr::bad_params(format!("duplicate subject {}", subject)));
        }
        let score = parse_score(item.get("score"), "score")?;
        let full_score = match item.get("fullScore") {
            None | Some(Value::Null) => FULL_SCORE,
            v => parse_score(v, "fullScore")?,
        };
        if full_score <= 0.0 {
            return Err(HandlerErr::bad_params("fullScore must be positive"));
        }
        check_range(score, full_score, &subject)?;
        out.push(SubjectGrade {
            subject,
            score,
            full_score,
        });
    }
    Ok(out)
}

/// Loads the student behind a record and checks the caller may write its class.
fn writable_student<'a>(
    students: &'a [Student],
    student_id: &str,
    visible: &Option<HashSet<String>>,
) -> Result<&'a Student, HandlerErr> {
    let student = find_by_id(students, student_id, |s| s.id.as_str(), "student")?;
    if !class_visible(visible, &student.class_id) {
        return Err(HandlerErr::forbidden("student is not in one of your classes"));
    }
    Ok(student)
}

fn scores_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (actor, school_id) = require_staff(conn, params)?;
    let exam_id = get_required_str(params, "examId")?;
    let query = get_opt_str(params, "query")?;

    let exams: Vec<Exam> = store::get(conn, &school_id)?;
    find_by_id(&exams, &exam_id, |e| e.id.as_str(), "exam")?;
    let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let visible = visible_class_ids(&classes, &actor);
    let students: Vec<Student> = store::get(conn, &school_id)?;
    let records: Vec<GradeRecord> = store::get(conn, &school_id)?;

    let mut rows = Vec::new();
    for rec in records.iter().filter(|r| r.exam_id == exam_id) {
        let Some(student) = students.iter().find(|s| s.id == rec.student_id) else {
            continue;
        };
        if !class_visible(&visible, &student.class_id) {
            continue;
        }
        if !matches_query(query.as_deref(), &student.name, &student.student_no) {
            continue;
        }
        let class_name = classes
            .iter()
            .find(|c| c.id == student.class_id)
            .map(|c| c.name.as_str());
        rows.push(json!({
            "record": to_json(rec)?,
            "student": to_json(student)?,
            "className": class_name,
            "total": rec.total(),
        }));
    }
    Ok(json!({ "rows": rows }))
}

fn scores_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (actor, school_id) = require_staff(conn, params)?;
    let record_id = get_required_str(params, "recordId")?;
    let subject = get_required_str(params, "subject")?;
    let score = parse_score(params.get("score"), "score")?;

    let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let visible = visible_class_ids(&classes, &actor);
    let students: Vec<Student> = store::get(conn, &school_id)?;
    let records: Vec<GradeRecord> = store::get(conn, &school_id)?;
    let mut record = find_by_id(&records, &record_id, |r| r.id.as_str(), "grade record")?.clone();
    writable_student(&students, &record.student_id, &visible)?;

    match record.grades.iter_mut().find(|g| g.subject == subject) {
        Some(g) => {
            check_range(score, g.full_score, &subject)?;
            g.score = score;
        }
        None => {
            check_range(score, FULL_SCORE, &subject)?;
            record.grades.push(SubjectGrade {
                subject,
                score,
                full_score: FULL_SCORE,
            });
        }
    }

    store::update_record_grades(conn, &record).map_err(db_write("db_update_failed"))?;
    Ok(json!({ "record": to_json(&record)?, "total": record.total() }))
}

/// Manual entry: replaces the student's grades for the exam or adds a record.
fn scores_upsert(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (actor, school_id) = require_staff(conn, params)?;
    let exam_id = get_required_str(params, "examId")?;
    let student_id = get_required_str(params, "studentId")?;
    let grades = parse_grades(params)?;

    let exams: Vec<Exam> = store::get(conn, &school_id)?;
    find_by_id(&exams, &exam_id, |e| e.id.as_str(), "exam")?;
    let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
    let visible = visible_class_ids(&classes, &actor);
    let students: Vec<Student> = store::get(conn, &school_id)?;
    writable_student(&students, &student_id, &visible)?;

    let records: Vec<GradeRecord> = store::get(conn, &school_id)?;
    let existing = records
        .iter()
        .find(|r| r.exam_id == exam_id && r.student_id == student_id)
        .cloned();

    let tx = begin(conn)?;
    let (record, created) = match existing {
        Some(mut rec) => {
            rec.grades = grades;
            store::update_record_grades(&tx, &rec).map_err(db_write("db_update_failed"))?;
            (rec, false)
        }
        None => {
            let rec = GradeRecord {
                id: new_id(),
                student_id,
                exam_id,
                school_id: school_id.clone(),
                grades,
            };
            store::append_grade_records(&tx, &school_id, std::slice::from_ref(&rec))
                .map_err(db_write("db_insert_failed"))?;
            (rec, true)
        }
    };
    commit(tx)?;
    Ok(json!({ "record": to_json(&record)?, "created": created, "total": record.total() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.list" => Some(run(state, req, scores_list)),
        "scores.update" => Some(run(state, req, scores_update)),
        "scores.upsert" => Some(run(state, req, scores_upsert)),
        _ => None,
    }
}
