use std::path::PathBuf;

use rusqlite::Connection;
use serde_json::{json, Value};

use crate::ipc::handlers::exams::exam_date;
use crate::ipc::helpers::{
    begin, commit, db_write, find_by_id, get_opt_str, get_required_str, require_actor, run,
    to_json, visible_class_ids, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Exam, GradeLevel, Role, SchoolClass, Semester, Student};
use crate::reconcile::{
    reconcile_rows, Actor, ExamContext, ImportError, Roster, RosterBatch, ScoreRow,
};
use crate::sheet::{self, SheetError, SheetRow};
use crate::store;

fn unreadable(e: SheetError) -> HandlerErr {
    HandlerErr::new("import_unreadable", e.to_string())
}

/// Rows come from `filePath` (xlsx or csv) or inline `rows` objects.
fn load_rows(params: &Value) -> Result<Vec<ScoreRow>, HandlerErr> {
    let raw: Vec<SheetRow> = match (get_opt_str(params, "filePath")?, params.get("rows")) {
        (Some(path), _) => sheet::read_rows(&PathBuf::from(path)).map_err(unreadable)?,
        (None, Some(rows)) if !rows.is_null() => sheet::rows_from_json(rows).map_err(unreadable)?,
        _ => return Err(HandlerErr::bad_params("missing filePath or rows")),
    };
    Ok(raw.iter().map(ScoreRow::from_sheet_row).collect())
}

/// Admins import freely; teachers are confined to the classes they teach.
fn import_actor(conn: &Connection, params: &Value) -> Result<(Actor, String), HandlerErr> {
    let user = require_actor(conn, params)?;
    let school_id = user
        .school_id
        .clone()
        .ok_or_else(|| HandlerErr::forbidden("actor has no school"))?;
    let actor = match user.role {
        Role::Admin => Actor::Admin,
        Role::Teacher => {
            let classes: Vec<SchoolClass> = store::get(conn, &school_id)?;
            Actor::Teacher {
                permitted_class_ids: visible_class_ids(&classes, &user),
            }
        }
        Role::Parent => return Err(HandlerErr::forbidden("parents cannot import scores")),
    };
    Ok((actor, school_id))
}

fn load_roster(conn: &Connection, school_id: &str) -> Result<Roster, HandlerErr> {
    Ok(Roster {
        grade_levels: store::get::<GradeLevel>(conn, school_id)?,
        classes: store::get::<SchoolClass>(conn, school_id)?,
        students: store::get::<Student>(conn, school_id)?,
    })
}

fn batch_preview(batch: &RosterBatch, before: &Roster) -> Result<Value, HandlerErr> {
    let new_grades: Vec<&str> = batch.grade_levels[before.grade_levels.len()..]
        .iter()
        .map(|g| g.name.as_str())
        .collect();
    let new_classes: Vec<Value> = batch.classes[before.classes.len()..]
        .iter()
        .map(|c| {
            let grade = batch
                .grade_levels
                .iter()
                .find(|g| g.id == c.grade_id)
                .map(|g| g.name.as_str());
            json!({ "grade": grade, "name": c.name })
        })
        .collect();
    let new_students: Vec<Value> = batch.students[before.students.len()..]
        .iter()
        .map(|s| json!({ "studentNo": s.student_no, "name": s.name }))
        .collect();
    Ok(json!({
        "summary": to_json(&batch.summary)?,
        "newGradeLevels": new_grades,
        "newClasses": new_classes,
        "newStudents": new_students,
    }))
}

fn import_preview(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (actor, school_id) = import_actor(conn, params)?;
    let rows = load_rows(params)?;
    let roster = load_roster(conn, &school_id)?;
    let batch = reconcile_rows(&school_id, &actor, roster.clone(), &rows);
    batch_preview(&batch, &roster)
}

fn import_scores(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (actor, school_id) = import_actor(conn, params)?;
    let exam_name = get_required_str(params, "examName")?;
    let semester_id = get_required_str(params, "semesterId")?;
    let date = exam_date(params, "examDate")?;

    let semesters: Vec<Semester> = store::get(conn, &school_id)?;
    find_by_id(&semesters, &semester_id, |s| s.id.as_str(), "semester")?;

    // An unreadable file fails here, before any row is looked at.
    let rows = load_rows(params)?;
    let roster = load_roster(conn, &school_id)?;
    let batch = reconcile_rows(&school_id, &actor, roster, &rows);

    let plan = batch
        .finalize(ExamContext {
            name: exam_name,
            semester_id,
            date,
        })
        .map_err(|e| match e {
            ImportError::NoValidRows { total, skipped } => {
                tracing::info!(total, skipped, "import rejected: no valid rows");
                HandlerErr::new("import_no_valid_rows", e.to_string())
                    .with_details(json!({ "total": total, "skipped": skipped }))
            }
        })?;

    let mut exams: Vec<Exam> = store::get(conn, &school_id)?;
    exams.push(plan.exam.clone());

    let tx = begin(conn)?;
    store::save(&tx, &school_id, &plan.grade_levels).map_err(db_write("db_insert_failed"))?;
    store::save(&tx, &school_id, &plan.classes).map_err(db_write("db_insert_failed"))?;
    store::save(&tx, &school_id, &plan.students).map_err(db_write("db_insert_failed"))?;
    store::save(&tx, &school_id, &exams).map_err(db_write("db_insert_failed"))?;
    store::append_grade_records(&tx, &school_id, &plan.records)
        .map_err(db_write("db_insert_failed"))?;
    commit(tx)?;

    let s = &plan.summary;
    tracing::info!(
        exam_id = %plan.exam.id,
        total = s.total,
        imported = s.imported,
        skipped = s.skipped,
        created_students = s.created_students,
        "scores imported"
    );
    Ok(json!({
        "exam": to_json(&plan.exam)?,
        "summary": to_json(&plan.summary)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "import.preview" => Some(run(state, req, import_preview)),
        "import.scores" => Some(run(state, req, import_scores)),
        _ => None,
    }
}
