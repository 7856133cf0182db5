//! REST API route definitions
//!
//! Everything except the health probes is nested under `/api`. Handlers stay thin:
//! they parse the request, call one service and let [MaintenanceError](crate::error::MaintenanceError)
//! pick the status code.

pub mod exclusions;
pub mod health;
pub mod maintenance;
pub mod rules;
pub mod servers;

use axum::Router;
use axum::http::HeaderMap;

use crate::app::AppState;

/// Header naming the operator behind a request; recorded in the audit log
pub const ACTOR_HEADER: &str = "x-cullarr-user";

const DEFAULT_ACTOR: &str = "api";

/// The operator name for audit records
pub fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(maintenance::router())
        .merge(rules::router())
        .merge(exclusions::router())
        .merge(servers::router())
}
