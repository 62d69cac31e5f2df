use std::collections::HashSet;

use rusqlite::{Connection, Transaction};
use serde_json::Value;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{Role, SchoolClass, User};
use crate::store;

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn response(self, id: &str) -> Value {
        if self.code.starts_with("db_") {
            tracing::warn!(code = self.code, message = %self.message, "storage error");
        }
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

/// Maps a storage error on a write path to the given code.
pub fn db_write(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| match e {
        rusqlite::Error::SqliteFailure(f, ref msg)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            HandlerErr::conflict(msg.clone().unwrap_or_else(|| "constraint violation".into()))
        }
        other => HandlerErr::new(code, other.to_string()),
    }
}

/// Resolves the workspace connection and maps the handler result to an envelope.
pub fn run<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, &Value) -> Result<Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => {
            tracing::debug!(method = %req.method, code = e.code, "request failed");
            e.response(&req.id)
        }
    }
}

pub fn begin(conn: &Connection) -> Result<Transaction<'_>, HandlerErr> {
    conn.unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))
}

pub fn commit(tx: Transaction<'_>) -> Result<(), HandlerErr> {
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Absent, null and blank all read as `None`.
pub fn get_opt_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_string_array(params: &Value, key: &str) -> Result<Option<Vec<String>>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut out: Vec<String> = Vec::with_capacity(items.len());
            for item in items {
                let s = item
                    .as_str()
                    .ok_or_else(|| {
                        HandlerErr::bad_params(format!("{} must be an array of strings", key))
                    })?
                    .trim()
                    .to_string();
                if !s.is_empty() && !out.contains(&s) {
                    out.push(s);
                }
            }
            Ok(Some(out))
        }
        Some(_) => Err(HandlerErr::bad_params(format!(
            "{} must be an array of strings",
            key
        ))),
    }
}

pub fn to_json<T: serde::Serialize>(v: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(v).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

/// Case-insensitive name match or student-number substring match.
pub fn matches_query(query: Option<&str>, name: &str, number: &str) -> bool {
    match query {
        None => true,
        Some(q) => name.to_lowercase().contains(&q.to_lowercase()) || number.contains(q),
    }
}

// ---------------------------------------------------------------------------
// Callers
// ---------------------------------------------------------------------------

/// The calling user, identified by `params.actorId`.
pub fn require_actor(conn: &Connection, params: &Value) -> Result<User, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    store::user_by_id(conn, &actor_id)?
        .ok_or_else(|| HandlerErr::new("unauthorized", "unknown actor"))
}

/// Caller with one of `roles` who belongs to a school. Returns the school id.
pub fn require_school_role(
    conn: &Connection,
    params: &Value,
    roles: &[Role],
) -> Result<(User, String), HandlerErr> {
    let actor = require_actor(conn, params)?;
    if !roles.contains(&actor.role) {
        return Err(HandlerErr::forbidden(format!(
            "{} may not call this method",
            actor.role.as_str()
        )));
    }
    let school_id = actor
        .school_id
        .clone()
        .ok_or_else(|| HandlerErr::forbidden("actor has no school"))?;
    Ok((actor, school_id))
}

pub fn require_admin(conn: &Connection, params: &Value) -> Result<(User, String), HandlerErr> {
    require_school_role(conn, params, &[Role::Admin])
}

pub fn require_staff(conn: &Connection, params: &Value) -> Result<(User, String), HandlerErr> {
    require_school_role(conn, params, &[Role::Admin, Role::Teacher])
}

pub fn require_parent(conn: &Connection, params: &Value) -> Result<User, HandlerErr> {
    let actor = require_actor(conn, params)?;
    if actor.role != Role::Parent {
        return Err(HandlerErr::forbidden("only parents may call this method"));
    }
    Ok(actor)
}

/// Classes a teacher may see and write. `None` for admins (no restriction).
pub fn visible_class_ids(
    classes: &[SchoolClass],
    actor: &User,
) -> Option<HashSet<String>> {
    match actor.role {
        Role::Teacher => Some(
            classes
                .iter()
                .filter(|c| c.is_taught_by(&actor.id))
                .map(|c| c.id.clone())
                .collect(),
        ),
        _ => None,
    }
}

pub fn class_visible(visible: &Option<HashSet<String>>, class_id: &str) -> bool {
    visible.as_ref().map_or(true, |ids| ids.contains(class_id))
}

pub fn find_by_id<'a, T, F>(items: &'a [T], id: &str, key: F, what: &str) -> Result<&'a T, HandlerErr>
where
    F: Fn(&T) -> &str,
{
    items
        .iter()
        .find(|i| key(i) == id)
        .ok_or_else(|| HandlerErr::not_found(what))
}
