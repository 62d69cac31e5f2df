use rusqlite::Connection;
use serde_json::{json, Value};

use crate::auth::{generate_invite_code, normalize_invite_code};
use crate::ipc::helpers::{
    db_write, find_by_id, get_required_str, new_id, require_admin, run, to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{GradeLevel, Invitation, SchoolClass};
use crate::store;

const CODE_ATTEMPTS: usize = 8;

fn invitations_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let invitations: Vec<Invitation> = store::get(conn, &school_id)?;
    Ok(json!({ "invitations": to_json(&invitations)? }))
}

fn invitations_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let grade_id = get_required_str(params, "gradeId")?;
    let grades: Vec<GradeLevel> = store::get(conn, &school_id)?;
    find_by_id(&grades, &grade_id, |g| g.id.as_str(), "grade level")?;

    let mut invitations: Vec<Invitation> = store::get(conn, &school_id)?;
    let code = (0..CODE_ATTEMPTS)
        .map(|_| generate_invite_code())
        .find(|c| matches!(store::invitation_by_code(conn, c), Ok(None)))
        .ok_or_else(|| HandlerErr::new("db_insert_failed", "could not allocate an invite code"))?;

    let invitation = Invitation {
        id: new_id(),
        school_id: school_id.clone(),
        grade_id,
        code,
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    invitations.push(invitation.clone());
    store::save(conn, &school_id, &invitations).map_err(db_write("db_insert_failed"))?;
    Ok(json!({ "invitation": to_json(&invitation)? }))
}

fn invitations_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (_, school_id) = require_admin(conn, params)?;
    let invitation_id = get_required_str(params, "invitationId")?;

    let mut invitations: Vec<Invitation> = store::get(conn, &school_id)?;
    let before = invitations.len();
    invitations.retain(|i| i.id != invitation_id);
    if invitations.len() == before {
        return Err(HandlerErr::not_found("invitation"));
    }
    store::save(conn, &school_id, &invitations).map_err(db_write("db_delete_failed"))?;
    Ok(json!({ "deleted": true }))
}

/// Public: a parent holding a code learns which school, grade and classes it opens.
pub fn resolve_code(conn: &Connection, code: &str) -> Result<Invitation, HandlerErr> {
    store::invitation_by_code(conn, &normalize_invite_code(code))?
        .ok_or_else(|| HandlerErr::new("invalid_invite_code", "invite code is invalid or expired"))
}

fn invitations_resolve(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let invitation = resolve_code(conn, &code)?;

    let school = store::school_by_id(conn, &invitation.school_id)?;
    let grades: Vec<GradeLevel> = store::get(conn, &invitation.school_id)?;
    let grade_name = grades
        .iter()
        .find(|g| g.id == invitation.grade_id)
        .map(|g| g.name.clone());
    let classes: Vec<SchoolClass> = store::get(conn, &invitation.school_id)?;
    let classes: Vec<Value> = classes
        .iter()
        .filter(|c| c.grade_id == invitation.grade_id)
        .map(|c| json!({ "id": c.id, "name": c.name }))
        .collect();

    Ok(json!({
        "schoolId": invitation.school_id,
        "schoolName": school.map(|s| s.name),
        "gradeId": invitation.grade_id,
        "gradeName": grade_name,
        "classes": classes,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "invitations.list" => Some(run(state, req, invitations_list)),
        "invitations.create" => Some(run(state, req, invitations_create)),
        "invitations.delete" => Some(run(state, req, invitations_delete)),
        "invitations.resolve" => Some(run(state, req, invitations_resolve)),
        _ => None,
    }
}
