//! Maintenance rule repository
//!
//! A rule pairs one criterion from a fixed set with JSON parameters and the list
//! of (server, library) pairs it applies to.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};

/// Deletion criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RuleCriterion {
    UnwatchedMovie,
    StaleMovie,
    UnwatchedShow,
    StaleShow,
    KeepLatestSeasons,
    LowResolution,
    LargeFile,
}

impl RuleCriterion {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCriterion::UnwatchedMovie => "unwatched_movie",
            RuleCriterion::StaleMovie => "stale_movie",
            RuleCriterion::UnwatchedShow => "unwatched_show",
            RuleCriterion::StaleShow => "stale_show",
            RuleCriterion::KeepLatestSeasons => "keep_latest_seasons",
            RuleCriterion::LowResolution => "low_resolution",
            RuleCriterion::LargeFile => "large_file",
        }
    }
}

impl std::fmt::Display for RuleCriterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One library a rule applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleScope {
    pub server_id: i64,
    pub library_id: String,
}

/// Maintenance rule record from database
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MaintenanceRuleRecord {
    pub id: i64,
    pub name: String,
    pub criterion: RuleCriterion,
    pub parameters: Json<JsonValue>,
    pub libraries: Json<Vec<RuleScope>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MaintenanceRuleRecord {
    /// Whether the rule covers the given library
    pub fn covers(&self, server_id: i64, library_id: &str) -> bool {
        self.libraries
            .iter()
            .any(|s| s.server_id == server_id && s.library_id == library_id)
    }
}

/// Input for creating a rule
#[derive(Debug, Clone)]
pub struct CreateRule {
    pub name: String,
    pub criterion: RuleCriterion,
    pub parameters: JsonValue,
    pub libraries: Vec<RuleScope>,
    pub enabled: bool,
}

/// Input for updating a rule
#[derive(Debug, Clone, Default)]
pub struct UpdateRule {
    pub name: Option<String>,
    pub parameters: Option<JsonValue>,
    pub libraries: Option<Vec<RuleScope>>,
    pub enabled: Option<bool>,
}

const RULE_COLUMNS: &str =
    "id, name, criterion, parameters, libraries, enabled, created_at, updated_at";

pub struct RuleRepository {
    pool: SqlitePool,
}

impl RuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a rule by ID
    pub async fn get(&self, id: i64) -> Result<Option<MaintenanceRuleRecord>> {
        let record = sqlx::query_as::<_, MaintenanceRuleRecord>(&format!(
            "SELECT {} FROM maintenance_rules WHERE id = ?",
            RULE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// All rules
    pub async fn list(&self) -> Result<Vec<MaintenanceRuleRecord>> {
        let records = sqlx::query_as::<_, MaintenanceRuleRecord>(&format!(
            "SELECT {} FROM maintenance_rules ORDER BY name",
            RULE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Enabled rules whose scope includes the library
    pub async fn list_enabled_for_library(
        &self,
        server_id: i64,
        library_id: &str,
    ) -> Result<Vec<MaintenanceRuleRecord>> {
        let records = sqlx::query_as::<_, MaintenanceRuleRecord>(&format!(
            "SELECT {} FROM maintenance_rules WHERE enabled = 1 ORDER BY id",
            RULE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records
            .into_iter()
            .filter(|r| r.covers(server_id, library_id))
            .collect())
    }

    /// Create a new rule
    pub async fn create(&self, input: CreateRule) -> Result<MaintenanceRuleRecord> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, MaintenanceRuleRecord>(&format!(
            r#"
            INSERT INTO maintenance_rules (name, criterion, parameters, libraries, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            RULE_COLUMNS
        ))
        .bind(&input.name)
        .bind(input.criterion)
        .bind(Json(&input.parameters))
        .bind(Json(&input.libraries))
        .bind(input.enabled)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Update a rule
    pub async fn update(&self, id: i64, input: UpdateRule) -> Result<Option<MaintenanceRuleRecord>> {
        let record = sqlx::query_as::<_, MaintenanceRuleRecord>(&format!(
            r#"
            UPDATE maintenance_rules SET
                name = COALESCE(?, name),
                parameters = COALESCE(?, parameters),
                libraries = COALESCE(?, libraries),
                enabled = COALESCE(?, enabled),
                updated_at = ?
            WHERE id = ?
            RETURNING {}
            "#,
            RULE_COLUMNS
        ))
        .bind(&input.name)
        .bind(input.parameters.as_ref().map(Json))
        .bind(input.libraries.as_ref().map(Json))
        .bind(input.enabled)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Delete a rule; its candidates and exclusions cascade
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM maintenance_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
