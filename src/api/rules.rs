//! Maintenance rule endpoints
//!
//! Parameters are validated against the rule's criterion before anything is
//! stored, and every write re-evaluates the rule so its candidates match at once.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::app::AppState;
use crate::db::{CreateRule, MaintenanceRuleRecord, RuleCriterion, RuleScope, UpdateRule};
use crate::error::{MaintenanceError, MaintenanceResult};
use crate::services::maintenance::RuleParams;

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub criterion: RuleCriterion,
    #[serde(default = "empty_object")]
    pub parameters: JsonValue,
    pub libraries: Vec<RuleScope>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub parameters: Option<JsonValue>,
    pub libraries: Option<Vec<RuleScope>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct RuleResponse {
    #[serde(flatten)]
    pub rule: MaintenanceRuleRecord,
    /// Candidates after the write's evaluation
    pub candidates: usize,
}

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub candidates: usize,
}

#[derive(Debug, Serialize)]
pub struct PreviewMatch {
    pub library_item_id: i64,
    pub reason: String,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

fn default_enabled() -> bool {
    true
}

fn validate_name(name: &str) -> MaintenanceResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(MaintenanceError::Validation("name must not be empty".to_string()));
    }
    Ok(name.to_string())
}

/// Every scope must name a library of a known server
async fn validate_libraries(state: &AppState, libraries: &[RuleScope]) -> MaintenanceResult<()> {
    if libraries.is_empty() {
        return Err(MaintenanceError::Validation(
            "libraries must not be empty".to_string(),
        ));
    }
    for scope in libraries {
        if scope.library_id.trim().is_empty() {
            return Err(MaintenanceError::Validation(
                "library_id must not be empty".to_string(),
            ));
        }
        match state.servers.get(scope.server_id).await {
            Ok(_) => {}
            Err(MaintenanceError::NotFound { .. }) => {
                return Err(MaintenanceError::Validation(format!(
                    "unknown server {}",
                    scope.server_id
                )));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn load(state: &AppState, id: i64) -> MaintenanceResult<MaintenanceRuleRecord> {
    state
        .db
        .rules()
        .get(id)
        .await?
        .ok_or_else(|| MaintenanceError::not_found("rule", id))
}

async fn list_rules(State(state): State<AppState>) -> MaintenanceResult<Json<Vec<MaintenanceRuleRecord>>> {
    Ok(Json(state.db.rules().list().await?))
}

async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> MaintenanceResult<Json<MaintenanceRuleRecord>> {
    Ok(Json(load(&state, id).await?))
}

async fn create_rule(
    State(state): State<AppState>,
    Json(body): Json<CreateRuleRequest>,
) -> MaintenanceResult<(StatusCode, Json<RuleResponse>)> {
    let name = validate_name(&body.name)?;
    RuleParams::parse(body.criterion, &body.parameters)?;
    validate_libraries(&state, &body.libraries).await?;

    let rule = state
        .db
        .rules()
        .create(CreateRule {
            name,
            criterion: body.criterion,
            parameters: body.parameters,
            libraries: body.libraries,
            enabled: body.enabled,
        })
        .await?;
    info!(rule_id = rule.id, criterion = %rule.criterion, "Rule created");

    let candidates = state.evaluator.refresh_rule(&rule).await?;
    Ok((StatusCode::CREATED, Json(RuleResponse { rule, candidates })))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateRuleRequest>,
) -> MaintenanceResult<Json<RuleResponse>> {
    let existing = load(&state, id).await?;
    let name = body.name.as_deref().map(validate_name).transpose()?;
    if let Some(parameters) = &body.parameters {
        RuleParams::parse(existing.criterion, parameters)?;
    }
    if let Some(libraries) = &body.libraries {
        validate_libraries(&state, libraries).await?;
    }

    let rule = state
        .db
        .rules()
        .update(
            id,
            UpdateRule {
                name,
                parameters: body.parameters,
                libraries: body.libraries,
                enabled: body.enabled,
            },
        )
        .await?
        .ok_or_else(|| MaintenanceError::not_found("rule", id))?;
    info!(rule_id = rule.id, enabled = rule.enabled, "Rule updated");

    let candidates = state.evaluator.refresh_rule(&rule).await?;
    Ok(Json(RuleResponse { rule, candidates }))
}

async fn delete_rule(State(state): State<AppState>, Path(id): Path<i64>) -> MaintenanceResult<StatusCode> {
    if !state.db.rules().delete(id).await? {
        return Err(MaintenanceError::not_found("rule", id));
    }
    info!(rule_id = id, "Rule deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Re-evaluate a rule now
async fn evaluate_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> MaintenanceResult<Json<EvaluateResponse>> {
    let rule = load(&state, id).await?;
    let candidates = state.evaluator.refresh_rule(&rule).await?;
    Ok(Json(EvaluateResponse { candidates }))
}

/// What the rule would match right now. Nothing is written, and disabled rules are evaluated too.
async fn preview_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> MaintenanceResult<Json<Vec<PreviewMatch>>> {
    let rule = load(&state, id).await?;
    let matches = state
        .evaluator
        .evaluate_rule(&rule)
        .await?
        .into_iter()
        .map(|c| PreviewMatch {
            library_item_id: c.library_item_id,
            reason: c.reason,
        })
        .collect();
    Ok(Json(matches))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/maintenance/rules", get(list_rules).post(create_rule))
        .route(
            "/maintenance/rules/{id}",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/maintenance/rules/{id}/evaluate", post(evaluate_rule))
        .route("/maintenance/rules/{id}/preview", get(preview_rule))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::app::testing::TestApp;
    use crate::db::fixtures;

    #[tokio::test]
    async fn test_create_evaluates_immediately() {
        let app = TestApp::new().await;
        let (server, _) = fixtures::library(app.db(), &["Alien", "Brazil"]).await;

        let (status, body) = app
            .post(
                "/api/maintenance/rules",
                json!({
                    "name": "Old unwatched movies",
                    "criterion": "unwatched_movie",
                    "parameters": { "days": 30 },
                    "libraries": [{ "server_id": server.id, "library_id": fixtures::LIBRARY }]
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["candidates"], 2);
        assert_eq!(body["enabled"], true);

        let (status, body) = app.get("/api/maintenance/rules").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_parameters_and_scopes() {
        let app = TestApp::new().await;
        let (server, _) = fixtures::library(app.db(), &["Alien"]).await;
        let scope = json!([{ "server_id": server.id, "library_id": fixtures::LIBRARY }]);

        let (status, body) = app
            .post(
                "/api/maintenance/rules",
                json!({
                    "name": "Trim",
                    "criterion": "keep_latest_seasons",
                    "parameters": { "keep_seasons": 0 },
                    "libraries": scope
                }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");

        let (status, _) = app
            .post(
                "/api/maintenance/rules",
                json!({
                    "name": "Low res",
                    "criterion": "low_resolution",
                    "parameters": { "max_resolution": "potato" },
                    "libraries": scope
                }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .post(
                "/api/maintenance/rules",
                json!({
                    "name": "Nowhere",
                    "criterion": "unwatched_movie",
                    "libraries": [{ "server_id": 404, "library_id": "1" }]
                }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_disable_clears_candidates_and_evaluate_restores_them() {
        let app = TestApp::new().await;
        let (_, items) = fixtures::library(app.db(), &["Alien"]).await;
        let rule = fixtures::rule(app.db(), crate::db::RuleCriterion::UnwatchedMovie, &items).await;
        let uri = format!("/api/maintenance/rules/{}", rule.id);

        let (status, body) = app.put(&uri, json!({ "enabled": false })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["candidates"], 0);

        let (status, body) = app.put(&uri, json!({ "enabled": true })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["candidates"], 1);

        let (status, body) = app.post(&format!("{}/evaluate", uri), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["candidates"], 1);
    }

    #[tokio::test]
    async fn test_preview_matches_without_writing_candidates() {
        let app = TestApp::new().await;
        let (_, items) = fixtures::library(app.db(), &["Alien", "Brazil"]).await;
        let rule = fixtures::rule(app.db(), crate::db::RuleCriterion::UnwatchedMovie, &items).await;
        let uri = format!("/api/maintenance/rules/{}", rule.id);

        let (status, _) = app.put(&uri, json!({ "enabled": false })).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = app.get(&format!("{}/preview", uri)).await;
        assert_eq!(status, StatusCode::OK);
        let matched: Vec<i64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["library_item_id"].as_i64().unwrap())
            .collect();
        assert_eq!(matched.len(), 2);
        assert!(matched.contains(&items[0].id));
        assert!(matched.contains(&items[1].id));
        assert!(app.db().candidates().list_rows_for_rule(rule.id).await.unwrap().is_empty());

        let (status, _) = app.get("/api/maintenance/rules/999/preview").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_rule() {
        let app = TestApp::new().await;
        let (_, items) = fixtures::library(app.db(), &["Alien"]).await;
        let rule = fixtures::rule(app.db(), crate::db::RuleCriterion::UnwatchedMovie, &items).await;
        let uri = format!("/api/maintenance/rules/{}", rule.id);

        let (status, _) = app.delete(&uri).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app.get(&uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app.delete(&uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
