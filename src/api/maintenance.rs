//! Maintenance REST endpoints: library sync, candidates, deletions, watch
//! history and the audit log.
//!
//! Long-running work (syncs, bulk deletes) runs on its own task. Progress is
//! available as server-sent events: `data:` frames carry progress and a final
//! `event: complete` frame carries the result.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::ACCEPT},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, future, stream};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::actor;
use crate::app::AppState;
use crate::db::sqlite_helpers::Page;
use crate::db::{CandidateListQuery, CandidateSort, CreateWatchEvent, PaginatedAudit, PaginatedCandidates};
use crate::error::{ErrorBody, MaintenanceError, MaintenanceResult};
use crate::services::maintenance::{BulkDeleteRequest, BulkDeleteResult, BulkEvent};
use crate::services::sync::{SyncEvent, SyncSubscription};

#[derive(Debug, Deserialize)]
pub struct StartSyncRequest {
    pub server_id: i64,
    pub library_id: String,
}

#[derive(Debug, Serialize)]
pub struct StartSyncResponse {
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct SyncEventsQuery {
    pub server_id: i64,
    pub library_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CandidatesQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteBody {
    pub candidate_ids: Vec<i64>,
    #[serde(default)]
    pub include_cross_server: bool,
}

#[derive(Debug, Deserialize)]
pub struct RecordWatchRequest {
    pub server_id: i64,
    pub item_id: String,
    pub user: String,
    /// Defaults to now
    pub watched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct RecordWatchResponse {
    pub id: i64,
}

/// Start a library sync
async fn start_sync(
    State(state): State<AppState>,
    Json(body): Json<StartSyncRequest>,
) -> MaintenanceResult<(StatusCode, Json<StartSyncResponse>)> {
    state.sync.start_sync(body.server_id, &body.library_id).await?;
    Ok((StatusCode::ACCEPTED, Json(StartSyncResponse { status: "started" })))
}

async fn sync_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sync.status())
}

/// Progress of one sync as server-sent events. A finished job yields only its
/// `complete` frame.
async fn sync_events(
    State(state): State<AppState>,
    Query(query): Query<SyncEventsQuery>,
) -> MaintenanceResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let subscription = state
        .sync
        .subscribe(query.server_id, &query.library_id)
        .ok_or_else(|| {
            MaintenanceError::not_found("sync", format!("{}:{}", query.server_id, query.library_id))
        })?;

    let stream = match subscription {
        SyncSubscription::Finished(result) => {
            stream::iter(vec![SyncEvent::Complete(result)]).left_stream()
        }
        SyncSubscription::Running { snapshot, events } => {
            let initial = stream::iter(snapshot.map(SyncEvent::Progress));
            let live = BroadcastStream::new(events).filter_map(|event| {
                future::ready(match event {
                    Ok(event) => Some(event),
                    Err(lagged) => {
                        debug!(error = %lagged, "Sync event subscriber lagged");
                        None
                    }
                })
            });
            initial.chain(live).right_stream()
        }
    };

    let frames = stream
        .scan(false, |done, event| {
            if *done {
                return future::ready(None);
            }
            *done = matches!(event, SyncEvent::Complete(_));
            future::ready(Some(event))
        })
        .map(|event| match event {
            SyncEvent::Progress(progress) => Event::default().json_data(progress),
            SyncEvent::Complete(result) => Event::default().event("complete").json_data(result),
        });

    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

async fn list_candidates(
    State(state): State<AppState>,
    Path(rule_id): Path<i64>,
    Query(query): Query<CandidatesQuery>,
) -> MaintenanceResult<Json<PaginatedCandidates>> {
    if state.db.rules().get(rule_id).await?.is_none() {
        return Err(MaintenanceError::not_found("rule", rule_id));
    }
    let list_query = CandidateListQuery {
        page: Page::new(query.page, query.per_page),
        search: query.search,
        sort: CandidateSort::parse(query.sort_by.as_deref()),
        descending: query
            .sort_order
            .as_deref()
            .is_some_and(|order| order.eq_ignore_ascii_case("desc")),
    };
    Ok(Json(state.db.candidates().list_for_rule(rule_id, &list_query).await?))
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

/// Delete a batch of candidates. Returns the result as JSON, or streams progress
/// when the client accepts `text/event-stream`. Dropping the connection cancels
/// the batch at its next pacing sleep.
async fn bulk_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BulkDeleteBody>,
) -> MaintenanceResult<Response> {
    let request = BulkDeleteRequest {
        candidate_ids: body.candidate_ids,
        include_cross_server: body.include_cross_server,
    };
    let actor = actor(&headers);
    let cancel = CancellationToken::new();
    info!(
        items = request.candidate_ids.len(),
        include_cross_server = request.include_cross_server,
        actor = %actor,
        "Bulk delete requested"
    );

    if wants_event_stream(&headers) {
        let guard = cancel.clone().drop_guard();
        let events = state.bulk.stream(request, actor, cancel)?;
        let frames = UnboundedReceiverStream::new(events).map(move |event| {
            let _connection = &guard;
            bulk_frame(event)
        });
        return Ok(Sse::new(frames).keep_alive(KeepAlive::default()).into_response());
    }

    let _guard = cancel.clone().drop_guard();
    let result: BulkDeleteResult = state.bulk.spawn(request, actor, cancel).await?;
    Ok(Json(result).into_response())
}

fn bulk_frame(event: BulkEvent) -> Result<Event, axum::Error> {
    match event {
        BulkEvent::Progress(progress) => Event::default().json_data(progress),
        BulkEvent::Complete(result) => Event::default().event("complete").json_data(result),
    }
}

/// Delete one candidate.
///
/// `204` on a clean delete, `200` with the outcome when the server delete
/// succeeded but something after it did not, `500` when the media server
/// refused, and the error's own status otherwise.
async fn delete_candidate(
    State(state): State<AppState>,
    Path(candidate_id): Path<i64>,
    headers: HeaderMap,
) -> MaintenanceResult<Response> {
    let mut outcome = state
        .deletion
        .spawn_delete_candidate(candidate_id, actor(&headers))
        .await?;

    let Some(error) = outcome.error.take() else {
        if outcome.warning.is_some() {
            return Ok((StatusCode::OK, Json(outcome)).into_response());
        }
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    match error {
        MaintenanceError::Upstream { .. } | MaintenanceError::Timeout(_) => {
            let body = ErrorBody {
                error: error.to_string(),
                code: error.code(),
            };
            Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response())
        }
        other => Err(other),
    }
}

/// Record a play reported by an external source
async fn record_watch(
    State(state): State<AppState>,
    Json(body): Json<RecordWatchRequest>,
) -> MaintenanceResult<(StatusCode, Json<RecordWatchResponse>)> {
    let item_id = body.item_id.trim();
    let user = body.user.trim();
    if item_id.is_empty() || user.is_empty() {
        return Err(MaintenanceError::Validation(
            "item_id and user must not be empty".to_string(),
        ));
    }
    state.servers.get(body.server_id).await?;

    let id = state
        .db
        .watch_history()
        .record(CreateWatchEvent {
            server_id: body.server_id,
            item_id: item_id.to_string(),
            user_name: user.to_string(),
            watched_at: body.watched_at.unwrap_or_else(Utc::now),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(RecordWatchResponse { id })))
}

async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> MaintenanceResult<Json<PaginatedAudit>> {
    let page = Page::new(query.page, query.per_page);
    Ok(Json(state.db.audit().list(page).await?))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/maintenance/sync", post(start_sync))
        .route("/maintenance/sync/status", get(sync_status))
        .route("/maintenance/sync/events", get(sync_events))
        .route("/maintenance/rules/{id}/candidates", get(list_candidates))
        .route("/maintenance/candidates/bulk-delete", post(bulk_delete))
        .route("/maintenance/candidates/{id}", delete(delete_candidate))
        .route("/maintenance/history", post(record_watch))
        .route("/maintenance/audit", get(list_audit))
}
