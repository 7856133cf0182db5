//! Media server endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};

use crate::app::AppState;
use crate::db::ServerRecord;
use crate::error::MaintenanceResult;
use crate::services::media_server::{RemoteLibrary, ServerInfo};
use crate::services::servers::{CreateServerRequest, UpdateServerRequest};

async fn list_servers(State(state): State<AppState>) -> MaintenanceResult<Json<Vec<ServerRecord>>> {
    Ok(Json(state.servers.list().await?))
}

async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> MaintenanceResult<Json<ServerRecord>> {
    Ok(Json(state.servers.get(id).await?))
}

async fn create_server(
    State(state): State<AppState>,
    Json(body): Json<CreateServerRequest>,
) -> MaintenanceResult<(StatusCode, Json<ServerRecord>)> {
    let server = state.servers.create(body).await?;
    Ok((StatusCode::CREATED, Json(server)))
}

async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateServerRequest>,
) -> MaintenanceResult<Json<ServerRecord>> {
    Ok(Json(state.servers.update(id, body).await?))
}

async fn delete_server(State(state): State<AppState>, Path(id): Path<i64>) -> MaintenanceResult<StatusCode> {
    state.servers.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> MaintenanceResult<Json<ServerInfo>> {
    Ok(Json(state.servers.test(id).await?))
}

async fn server_libraries(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> MaintenanceResult<Json<Vec<RemoteLibrary>>> {
    Ok(Json(state.servers.libraries(id).await?))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers", get(list_servers).post(create_server))
        .route(
            "/servers/{id}",
            get(get_server).put(update_server).delete(delete_server),
        )
        .route("/servers/{id}/test", post(test_server))
        .route("/servers/{id}/libraries", get(server_libraries))
}
