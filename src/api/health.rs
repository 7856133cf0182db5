//! Health check endpoints

use std::collections::HashMap;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use crate::app::AppState;
use crate::services::ServiceHealth;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub database: bool,
    /// Servers with a live adapter
    pub connected_servers: Vec<i64>,
    pub services: HashMap<String, ServiceHealth>,
}

/// Health check - always returns OK if the server is running
async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness check - verifies the database answers
async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let db_ok = sqlx::query("SELECT 1")
        .fetch_one(state.db.pool())
        .await
        .is_ok();
    let services = state.services.health_all().await;

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready: db_ok,
            database: db_ok,
            connected_servers: state.registry.server_ids(),
            services,
        }),
    )
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;

    use crate::app::testing::TestApp;
    use crate::db::fixtures;
    use crate::services::media_server::fake::FakeAdapter;

    #[tokio::test]
    async fn test_health_and_readiness() {
        let app = TestApp::new().await;

        let (status, body) = app.get("/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = app.get("/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], true);
        assert_eq!(body["connected_servers"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_readiness_lists_connected_servers() {
        let app = TestApp::new().await;
        let server = fixtures::server(app.db(), "Plex").await;
        app.factory
            .insert(server.id, Arc::new(FakeAdapter::new(&server.machine_id)));
        app.state.registry.connect(&server).unwrap();

        let (status, body) = app.get("/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected_servers"], serde_json::json!([server.id]));
    }
}
