use rusqlite::Connection;
use serde_json::{json, Value};

use crate::analysis::{self, AnalysisError, ExamHistoryEntry, DEFAULT_RELATIONSHIP};
use crate::ipc::error::ok;
use crate::ipc::handlers::parents::bound_child;
use crate::ipc::helpers::{
    class_visible, get_opt_str, get_required_str, require_actor, to_json, visible_class_ids,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Exam, GradeRecord, Role, SchoolClass, Student};
use crate::store;

/// Staff of the student's school (teachers only for their classes) or a
/// parent bound to the student.
fn accessible_student(conn: &Connection, params: &Value) -> Result<Student, HandlerErr> {
    let actor = require_actor(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    match actor.role {
        Role::Parent => bound_child(conn, &actor, &student_id),
        Role::Admin | Role::Teacher => {
            let student = store::student_by_id(conn, &student_id)?
                .filter(|s| Some(&s.school_id) == actor.school_id.as_ref())
                .ok_or_else(|| HandlerErr::not_found("student"))?;
            let classes: Vec<SchoolClass> = store::get(conn, &student.school_id)?;
            if !class_visible(&visible_class_ids(&classes, &actor), &student.class_id) {
                return Err(HandlerErr::forbidden("student is outside your classes"));
            }
            Ok(student)
        }
    }
}

fn load_history(conn: &Connection, params: &Value) -> Result<(Student, Vec<ExamHistoryEntry>), HandlerErr> {
    let student = accessible_student(conn, params)?;
    let exams: Vec<Exam> = store::get(conn, &student.school_id)?;
    let records: Vec<GradeRecord> = store::get::<GradeRecord>(conn, &student.school_id)?
        .into_iter()
        .filter(|r| r.student_id == student.id)
        .collect();
    let history = analysis::exam_history(&records, &exams);
    Ok((student, history))
}

fn ai_err(e: AnalysisError) -> HandlerErr {
    tracing::warn!(code = e.code(), error = %e, "analysis failed");
    HandlerErr::new(e.code(), e.to_string())
}

fn analysis_report(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let relationship = get_opt_str(params, "relationship")?
        .unwrap_or_else(|| DEFAULT_RELATIONSHIP.to_string());
    let (student, history) = load_history(conn, params)?;
    let model = state.ai.as_deref().ok_or_else(|| ai_err(AnalysisError::Unavailable))?;

    let report = analysis::analyze(model, &student.name, &relationship, &history).map_err(ai_err)?;
    tracing::info!(student_id = %student.id, exams = history.len(), "analysis report generated");
    Ok(json!({ "studentId": student.id, "report": to_json(&report)? }))
}

fn analysis_predict(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let (student, history) = load_history(conn, params)?;
    let model = state.ai.as_deref().ok_or_else(|| ai_err(AnalysisError::Unavailable))?;

    let prediction = analysis::predict(model, &student.name, &history).map_err(ai_err)?;
    tracing::info!(student_id = %student.id, exams = history.len(), "prediction generated");
    Ok(json!({ "studentId": student.id, "prediction": to_json(&prediction)? }))
}

fn respond(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analysis.report" => Some(respond(req, analysis_report(state, &req.params))),
        "analysis.predict" => Some(respond(req, analysis_predict(state, &req.params))),
        _ => None,
    }
}

