use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Family = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: &[Family] = &[
    handlers::core::try_handle,
    handlers::auth::try_handle,
    handlers::schools::try_handle,
    handlers::semesters::try_handle,
    handlers::grade_levels::try_handle,
    handlers::classes::try_handle,
    handlers::students::try_handle,
    handlers::teachers::try_handle,
    handlers::exams::try_handle,
    handlers::scores::try_handle,
    handlers::import::try_handle,
    handlers::invitations::try_handle,
    handlers::parents::try_handle,
    handlers::analysis::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");
    for family in FAMILIES {
        if let Some(resp) = family(state, &req) {
            return resp;
        }
    }

    tracing::warn!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
