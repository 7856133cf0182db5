//! Deletion pipeline
//!
//! Deletes one library item from its media server and reconciles local state.
//! Each side effect reports its own success flag: a remote delete can succeed
//! while the cache cleanup fails, and the caller is told exactly that.
//!
//! Steps, each under its own timeout:
//! 1. resolve the adapter (fail closed when the server is not configured)
//! 2. re-check exclusions right before the remote call
//! 3. remote delete (failure is terminal, the cache is left alone)
//! 4. cascade hooks (best effort)
//! 5. cache cleanup
//! 6. audit record (failures are logged, never returned)

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::criteria::RuleParams;
use crate::config::DeletionConfig;
use crate::db::{
    CandidateRecord, CreateAuditRecord, Database, LibraryItemRecord, RuleCriterion,
};
use crate::error::{MaintenanceError, MaintenanceResult};
use crate::services::cascade::CascadeHook;
use crate::services::media_server::{AdapterRegistry, MediaServerAdapter};

/// Warning attached when the remote delete succeeded but the cache still holds the item
pub const CLEANUP_WARNING: &str = "deleted on the server but local cleanup failed, refresh the library";

/// Result of one deletion attempt
#[derive(Debug, Default, Serialize)]
pub struct DeleteOutcome {
    pub server_deleted: bool,
    pub db_cleaned: bool,
    pub file_size: i64,
    /// Seasons removed by the season variant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seasons_deleted: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip)]
    pub error: Option<MaintenanceError>,
    /// Whether the remote delete call was issued
    #[serde(skip)]
    pub remote_attempted: bool,
    #[serde(skip)]
    pub item: Option<LibraryItemRecord>,
}

impl DeleteOutcome {
    fn failed(item: Option<LibraryItemRecord>, error: MaintenanceError) -> Self {
        Self {
            error: Some(error),
            item,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The media server itself refused or timed out. Only these count towards the
    /// bulk circuit breaker.
    pub fn is_remote_failure(&self) -> bool {
        self.remote_attempted && !self.server_deleted
    }

    /// The whole item is gone from its server. A season trim leaves the show in place.
    pub fn removed_item(&self) -> bool {
        self.server_deleted && self.seasons_deleted.is_none()
    }

    /// Whether the item was vetoed by an exclusion
    pub fn is_excluded(&self) -> bool {
        matches!(
            self.error,
            Some(MaintenanceError::Excluded | MaintenanceError::NewlyExcluded)
        )
    }
}

pub struct DeletionPipeline {
    db: Database,
    registry: Arc<AdapterRegistry>,
    hooks: Vec<Arc<dyn CascadeHook>>,
    config: DeletionConfig,
}

impl DeletionPipeline {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        hooks: Vec<Arc<dyn CascadeHook>>,
        config: DeletionConfig,
    ) -> Self {
        Self {
            db,
            registry,
            hooks,
            config,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Run [Self::delete_candidate_by_id] on its own task, so a dropped request
    /// cannot abandon a deletion half way.
    pub async fn spawn_delete_candidate(
        self: &Arc<Self>,
        candidate_id: i64,
        actor: String,
    ) -> MaintenanceResult<DeleteOutcome> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.delete_candidate_by_id(candidate_id, &actor).await })
            .await
            .map_err(|e| {
                error!(candidate_id, error = %e, "Deletion task failed");
                MaintenanceError::Internal("deletion task failed".to_string())
            })?
    }

    /// Load a candidate and delete it. Missing candidates are an error; every
    /// later failure is reported in the outcome.
    pub async fn delete_candidate_by_id(
        &self,
        candidate_id: i64,
        actor: &str,
    ) -> MaintenanceResult<DeleteOutcome> {
        let candidate = self
            .db_step("load candidate", self.db.candidates().get(candidate_id))
            .await?
            .ok_or_else(|| MaintenanceError::not_found("candidate", candidate_id))?;
        Ok(self.delete_candidate(&candidate, actor).await)
    }

    pub async fn delete_candidate(&self, candidate: &CandidateRecord, actor: &str) -> DeleteOutcome {
        let item = match self
            .db_step("load item", self.db.library_items().get(candidate.library_item_id))
            .await
        {
            Ok(Some(item)) => item,
            Ok(None) => {
                return DeleteOutcome::failed(
                    None,
                    MaintenanceError::not_found("library item", candidate.library_item_id),
                );
            }
            Err(e) => return DeleteOutcome::failed(None, e),
        };

        match self
            .db_step("exclusion check", self.db.exclusions().is_excluded(candidate.rule_id, item.id))
            .await
        {
            Ok(false) => {}
            Ok(true) => {
                debug!(candidate_id = candidate.id, item_id = item.id, "Candidate is excluded");
                return DeleteOutcome::failed(Some(item), MaintenanceError::Excluded);
            }
            Err(e) => return DeleteOutcome::failed(Some(item), e),
        }

        let keep_seasons = match self.keep_seasons_for(candidate.rule_id).await {
            Ok(keep) => keep,
            Err(e) => return DeleteOutcome::failed(Some(item), e),
        };
        match keep_seasons {
            Some(keep) => self.delete_oldest_seasons(candidate, item, keep, actor).await,
            None => self.delete_library_item(item, Some(candidate.rule_id), actor).await,
        }
    }

    /// Seasons to keep when the candidate's rule trims seasons instead of whole items
    async fn keep_seasons_for(&self, rule_id: i64) -> MaintenanceResult<Option<u32>> {
        let rule = self
            .db_step("load rule", self.db.rules().get(rule_id))
            .await?
            .ok_or_else(|| MaintenanceError::not_found("rule", rule_id))?;
        if rule.criterion != RuleCriterion::KeepLatestSeasons {
            return Ok(None);
        }
        let keep = RuleParams::parse(rule.criterion, &rule.parameters.0)
            .ok()
            .and_then(|params| params.keep_seasons())
            .unwrap_or(self.config.default_keep_seasons)
            .max(1);
        Ok(Some(keep))
    }

    /// Resolve the adapter and re-check exclusions. `rule_id: None` means the item
    /// must not be excluded from any rule.
    async fn prepare(
        &self,
        item: &LibraryItemRecord,
        rule_id: Option<i64>,
    ) -> MaintenanceResult<Arc<dyn MediaServerAdapter>> {
        let adapter = self
            .registry
            .get_server(item.server_id)
            .ok_or(MaintenanceError::NotConfigured(item.server_id))?;

        let exclusions = self.db.exclusions();
        let excluded = match rule_id {
            Some(rule_id) => {
                self.db_step("exclusion re-check", exclusions.is_excluded(rule_id, item.id))
                    .await?
            }
            None => {
                self.db_step("exclusion re-check", exclusions.is_excluded_from_any_rule(item.id))
                    .await?
            }
        };
        if excluded {
            return Err(MaintenanceError::NewlyExcluded);
        }
        Ok(adapter)
    }

    /// Delete a whole item from its server and the cache
    pub async fn delete_library_item(
        &self,
        item: LibraryItemRecord,
        rule_id: Option<i64>,
        actor: &str,
    ) -> DeleteOutcome {
        let adapter = match self.prepare(&item, rule_id).await {
            Ok(adapter) => adapter,
            Err(e) => {
                if !matches!(e, MaintenanceError::NewlyExcluded) {
                    self.audit(&item, &item.title, actor, false, Some(e.to_string())).await;
                } else {
                    info!(item_id = item.id, "Item was excluded while its deletion was pending");
                }
                return DeleteOutcome::failed(Some(item), e);
            }
        };

        let mut outcome = DeleteOutcome {
            file_size: item.file_size,
            remote_attempted: true,
            ..Default::default()
        };

        if let Err(e) = self
            .remote_step("remote delete", adapter.delete_item(&item.item_id))
            .await
        {
            warn!(server_id = item.server_id, item_id = %item.item_id, error = %e, "Remote delete failed");
            self.audit(&item, &item.title, actor, false, Some(e.to_string())).await;
            outcome.error = Some(e);
            outcome.item = Some(item);
            return outcome;
        }
        outcome.server_deleted = true;
        info!(server_id = item.server_id, item_id = %item.item_id, title = %item.title, "Item deleted on server");

        self.run_hooks(&item).await;

        match self.db_step("cache cleanup", self.db.library_items().delete(item.id)).await {
            Ok(_) => outcome.db_cleaned = true,
            Err(e) => {
                error!(item_id = item.id, error = %e, "Cache cleanup failed after remote delete");
                outcome.warning = Some(CLEANUP_WARNING.to_string());
            }
        }

        self.audit(&item, &item.title, actor, true, outcome.warning.clone()).await;
        outcome.item = Some(item);
        outcome
    }

    /// Trim a show to its newest `keep` seasons. Specials never count and are never
    /// deleted. Zero seasons deleted is an error.
    pub async fn delete_oldest_seasons(
        &self,
        candidate: &CandidateRecord,
        item: LibraryItemRecord,
        keep: u32,
        actor: &str,
    ) -> DeleteOutcome {
        let adapter = match self.prepare(&item, Some(candidate.rule_id)).await {
            Ok(adapter) => adapter,
            Err(e) => {
                if !matches!(e, MaintenanceError::NewlyExcluded) {
                    self.audit(&item, &item.title, actor, false, Some(e.to_string())).await;
                }
                return DeleteOutcome::failed(Some(item), e);
            }
        };

        let seasons = match self.remote_step("list seasons", adapter.get_seasons(&item.item_id)).await {
            Ok(seasons) => seasons,
            Err(e) => {
                self.audit(&item, &item.title, actor, false, Some(e.to_string())).await;
                return DeleteOutcome::failed(Some(item), e);
            }
        };
        let mut seasons: Vec<_> = seasons.into_iter().filter(|s| s.index > 0).collect();
        seasons.sort_by_key(|s| s.index);

        let excess = seasons.len().saturating_sub(keep as usize);
        if excess == 0 {
            let e = MaintenanceError::Validation(format!(
                "{} has {} seasons, nothing to delete when keeping {}",
                item.title,
                seasons.len(),
                keep
            ));
            return DeleteOutcome::failed(Some(item), e);
        }

        let mut outcome = DeleteOutcome {
            remote_attempted: true,
            ..Default::default()
        };
        let mut deleted = 0u32;
        let mut last_error = None;
        for (i, season) in seasons.iter().take(excess).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.season_delay).await;
            }
            match self.remote_step("remote season delete", adapter.delete_item(&season.id)).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(item_id = item.id, season = season.index, "Season deleted");
                }
                Err(e) => {
                    warn!(item_id = item.id, season = season.index, error = %e, "Season delete failed");
                    last_error = Some(e);
                }
            }
        }

        let label = format!("{} ({} of {} seasons)", item.title, deleted, excess);
        if deleted == 0 {
            let e = last_error.unwrap_or_else(|| {
                MaintenanceError::Internal("no seasons were deleted".to_string())
            });
            self.audit(&item, &label, actor, false, Some(e.to_string())).await;
            outcome.error = Some(e);
            outcome.item = Some(item);
            return outcome;
        }

        outcome.server_deleted = true;
        outcome.seasons_deleted = Some(deleted);
        if item.season_count > 0 {
            outcome.file_size = item.file_size * i64::from(deleted) / i64::from(item.season_count);
        }
        if let Some(e) = &last_error {
            outcome.warning = Some(format!("deleted {} of {} seasons: {}", deleted, excess, e));
        }

        let cleanup = async {
            self.db.candidates().delete(candidate.id).await?;
            self.db
                .library_items()
                .decrement_seasons(item.id, deleted as i32)
                .await
        };
        match self.db_step("season cleanup", cleanup).await {
            Ok(()) => outcome.db_cleaned = true,
            Err(e) => {
                error!(item_id = item.id, error = %e, "Cache cleanup failed after season delete");
                outcome.warning = Some(CLEANUP_WARNING.to_string());
            }
        }

        info!(item_id = item.id, title = %item.title, deleted, kept = keep, "Oldest seasons deleted");
        self.audit(&item, &label, actor, true, outcome.warning.clone()).await;
        outcome.item = Some(item);
        outcome
    }

    async fn run_hooks(&self, item: &LibraryItemRecord) {
        for hook in &self.hooks {
            match tokio::time::timeout(self.config.remote_timeout, hook.on_deleted(item)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(hook = hook.name(), item_id = item.id, error = %e, "Cascade hook failed")
                }
                Err(_) => warn!(hook = hook.name(), item_id = item.id, "Cascade hook timed out"),
            }
        }
    }

    async fn audit(
        &self,
        item: &LibraryItemRecord,
        title: &str,
        actor: &str,
        server_deleted: bool,
        error_message: Option<String>,
    ) {
        let record = CreateAuditRecord {
            server_id: item.server_id,
            item_id: item.item_id.clone(),
            title: title.to_string(),
            media_type: item.media_type,
            file_size: item.file_size,
            deleted_by: actor.to_string(),
            server_deleted,
            error_message,
        };
        if let Err(e) = self.db_step("audit", self.db.audit().record(record)).await {
            error!(item_id = item.id, error = %e, "Failed to write deletion audit record");
        }
    }

    async fn db_step<T>(
        &self,
        step: &'static str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> MaintenanceResult<T> {
        with_timeout(step, self.config.db_timeout, fut)
            .await?
            .map_err(MaintenanceError::from)
    }

    async fn remote_step<T>(
        &self,
        step: &'static str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> MaintenanceResult<T> {
        with_timeout(step, self.config.remote_timeout, fut)
            .await?
            .map_err(|e| MaintenanceError::upstream(step, format!("{:#}", e)))
    }
}

async fn with_timeout<T>(
    step: &'static str,
    limit: Duration,
    fut: impl Future<Output = T>,
) -> MaintenanceResult<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| MaintenanceError::Timeout(step))
}
