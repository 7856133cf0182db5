//! Exclusion endpoints
//!
//! Rule-scoped routes live under `/maintenance/rules/{id}/exclusions`; the same
//! operations under `/maintenance/exclusions` manage global exclusions, which
//! veto an item for every rule.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use super::actor;
use crate::app::AppState;
use crate::db::PaginatedExclusions;
use crate::db::sqlite_helpers::Page;
use crate::error::MaintenanceResult;

#[derive(Debug, Deserialize)]
pub struct ExclusionIdsRequest {
    pub library_item_ids: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExclusionListQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub created: u64,
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub removed: u64,
}

async fn create(
    state: &AppState,
    rule_id: Option<i64>,
    headers: &HeaderMap,
    body: ExclusionIdsRequest,
) -> MaintenanceResult<(StatusCode, Json<CreatedResponse>)> {
    let created = state
        .exclusions
        .create(rule_id, &body.library_item_ids, &actor(headers))
        .await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { created })))
}

async fn list(
    state: &AppState,
    rule_id: Option<i64>,
    query: ExclusionListQuery,
) -> MaintenanceResult<Json<PaginatedExclusions>> {
    let page = Page::new(query.page, query.per_page);
    Ok(Json(
        state
            .exclusions
            .list(rule_id, page, query.search.as_deref())
            .await?,
    ))
}

async fn remove_bulk(
    state: &AppState,
    rule_id: Option<i64>,
    body: ExclusionIdsRequest,
) -> MaintenanceResult<Json<RemovedResponse>> {
    let removed = state
        .exclusions
        .remove_bulk(rule_id, &body.library_item_ids)
        .await?;
    Ok(Json(RemovedResponse { removed }))
}

async fn create_rule_exclusions(
    State(state): State<AppState>,
    Path(rule_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<ExclusionIdsRequest>,
) -> MaintenanceResult<(StatusCode, Json<CreatedResponse>)> {
    create(&state, Some(rule_id), &headers, body).await
}

async fn list_rule_exclusions(
    State(state): State<AppState>,
    Path(rule_id): Path<i64>,
    Query(query): Query<ExclusionListQuery>,
) -> MaintenanceResult<Json<PaginatedExclusions>> {
    list(&state, Some(rule_id), query).await
}

async fn remove_rule_exclusion(
    State(state): State<AppState>,
    Path((rule_id, item_id)): Path<(i64, i64)>,
) -> MaintenanceResult<StatusCode> {
    state.exclusions.remove(Some(rule_id), item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_rule_exclusions(
    State(state): State<AppState>,
    Path(rule_id): Path<i64>,
    Json(body): Json<ExclusionIdsRequest>,
) -> MaintenanceResult<Json<RemovedResponse>> {
    remove_bulk(&state, Some(rule_id), body).await
}

async fn create_global_exclusions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExclusionIdsRequest>,
) -> MaintenanceResult<(StatusCode, Json<CreatedResponse>)> {
    create(&state, None, &headers, body).await
}

async fn list_global_exclusions(
    State(state): State<AppState>,
    Query(query): Query<ExclusionListQuery>,
) -> MaintenanceResult<Json<PaginatedExclusions>> {
    list(&state, None, query).await
}

async fn remove_global_exclusion(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> MaintenanceResult<StatusCode> {
    state.exclusions.remove(None, item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_global_exclusions(
    State(state): State<AppState>,
    Json(body): Json<ExclusionIdsRequest>,
) -> MaintenanceResult<Json<RemovedResponse>> {
    remove_bulk(&state, None, body).await
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/maintenance/rules/{id}/exclusions",
            get(list_rule_exclusions).post(create_rule_exclusions),
        )
        .route(
            "/maintenance/rules/{id}/exclusions/bulk-remove",
            post(remove_rule_exclusions),
        )
        .route(
            "/maintenance/rules/{id}/exclusions/{item_id}",
            delete(remove_rule_exclusion),
        )
        .route(
            "/maintenance/exclusions",
            get(list_global_exclusions).post(create_global_exclusions),
        )
        .route("/maintenance/exclusions/bulk-remove", post(remove_global_exclusions))
        .route("/maintenance/exclusions/{item_id}", delete(remove_global_exclusion))
}
