//! Bulk delete orchestration
//!
//! Candidates are deleted one at a time in input order through the
//! [DeletionPipeline]. Between items the orchestrator paces itself (longer
//! after a remote failure), and a run of consecutive remote failures aborts
//! the rest of the batch. Cancellation is only observed during the pacing
//! sleep, so an item in flight always finishes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::deletion::{DeleteOutcome, DeletionPipeline};
use super::validate_id_list;
use crate::config::BulkDeleteConfig;
use crate::db::{CandidateRecord, LibraryItemRecord};
use crate::error::{MaintenanceError, MaintenanceResult};

/// A failed item of a batch
#[derive(Debug, Clone, Serialize)]
pub struct BulkItemError {
    pub candidate_id: i64,
    pub library_item_id: Option<i64>,
    pub title: Option<String>,
    pub error: String,
    /// Never attempted because the batch was aborted or cancelled
    pub aborted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkDeleteResult {
    pub deleted: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total_size: i64,
    pub errors: Vec<BulkItemError>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkItemStatus {
    Deleting,
    Deleted,
    Failed,
    Skipped,
}

/// Emitted before and after every input item
#[derive(Debug, Clone, Serialize)]
pub struct BulkProgress {
    pub batch_id: Uuid,
    /// 1-based position in the input
    pub current: usize,
    pub total: usize,
    pub candidate_id: i64,
    pub title: Option<String>,
    pub status: BulkItemStatus,
    pub deleted: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Frames of a streamed batch. `Complete` is always the last one.
#[derive(Debug, Clone)]
pub enum BulkEvent {
    Progress(BulkProgress),
    Complete(BulkDeleteResult),
}

#[derive(Debug, Clone)]
pub struct BulkDeleteRequest {
    pub candidate_ids: Vec<i64>,
    pub include_cross_server: bool,
}

pub struct BulkDeleteOrchestrator {
    pipeline: Arc<DeletionPipeline>,
    config: BulkDeleteConfig,
}

/// Per-batch bookkeeping
struct Batch {
    id: Uuid,
    total: usize,
    result: BulkDeleteResult,
    /// Library items removed outright in this batch. Season trims are not recorded.
    deleted_items: HashSet<i64>,
    consecutive_failures: u32,
}

impl Batch {
    fn progress(&self, index: usize, candidate_id: i64, title: Option<String>, status: BulkItemStatus) -> BulkProgress {
        BulkProgress {
            batch_id: self.id,
            current: index + 1,
            total: self.total,
            candidate_id,
            title,
            status,
            deleted: self.result.deleted,
            failed: self.result.failed,
            skipped: self.result.skipped,
        }
    }

    fn fail(&mut self, candidate_id: i64, item: Option<&LibraryItemRecord>, error: String, aborted: bool) {
        self.result.failed += 1;
        self.result.errors.push(BulkItemError {
            candidate_id,
            library_item_id: item.map(|i| i.id),
            title: item.map(|i| i.title.clone()),
            error,
            aborted,
        });
    }

    fn record_success(&mut self, outcome: &DeleteOutcome) {
        self.result.deleted += 1;
        self.result.total_size += outcome.file_size;
        if outcome.removed_item() {
            if let Some(item) = &outcome.item {
                self.deleted_items.insert(item.id);
            }
        }
        if let Some(warning) = &outcome.warning {
            let title = outcome.item.as_ref().map(|i| i.title.as_str()).unwrap_or("item");
            self.result.warnings.push(format!("{}: {}", title, warning));
        }
    }
}

impl BulkDeleteOrchestrator {
    pub fn new(pipeline: Arc<DeletionPipeline>, config: BulkDeleteConfig) -> Self {
        Self { pipeline, config }
    }

    pub fn validate(&self, request: &BulkDeleteRequest) -> MaintenanceResult<()> {
        validate_id_list("candidate_ids", &request.candidate_ids, self.config.max_batch, false)?;
        Ok(())
    }

    /// Run a batch on its own task and wait for the result. Cancelling `cancel`
    /// stops the batch at its next pacing sleep.
    pub async fn spawn(
        self: &Arc<Self>,
        request: BulkDeleteRequest,
        actor: String,
        cancel: CancellationToken,
    ) -> MaintenanceResult<BulkDeleteResult> {
        self.validate(&request)?;
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator
                .execute_bulk_delete(&request, &actor, &cancel, |_| {})
                .await
        })
        .await
        .map_err(|e| MaintenanceError::Internal(format!("bulk delete task failed: {}", e)))?
    }

    /// Run a batch on its own task, streaming progress frames and a final
    /// [BulkEvent::Complete]. Validation errors are returned before anything starts.
    pub fn stream(
        self: &Arc<Self>,
        request: BulkDeleteRequest,
        actor: String,
        cancel: CancellationToken,
    ) -> MaintenanceResult<mpsc::UnboundedReceiver<BulkEvent>> {
        self.validate(&request)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let progress_tx = tx.clone();
            let result = orchestrator
                .execute_bulk_delete(&request, &actor, &cancel, move |progress| {
                    let _ = progress_tx.send(BulkEvent::Progress(progress));
                })
                .await;
            let result = result.unwrap_or_else(|e| BulkDeleteResult {
                warnings: vec![e.to_string()],
                ..Default::default()
            });
            let _ = tx.send(BulkEvent::Complete(result));
        });
        Ok(rx)
    }

    pub async fn execute_bulk_delete<F>(
        &self,
        request: &BulkDeleteRequest,
        actor: &str,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> MaintenanceResult<BulkDeleteResult>
    where
        F: Fn(BulkProgress) + Send + Sync,
    {
        let ids = validate_id_list("candidate_ids", &request.candidate_ids, self.config.max_batch, false)?;
        let mut candidates: HashMap<i64, CandidateRecord> = HashMap::with_capacity(ids.len());
        let repo = self.pipeline.db().candidates();
        for id in &ids {
            if let Some(candidate) = repo.get(*id).await? {
                candidates.insert(*id, candidate);
            }
        }

        let mut batch = Batch {
            id: Uuid::new_v4(),
            total: ids.len(),
            result: BulkDeleteResult::default(),
            deleted_items: HashSet::new(),
            consecutive_failures: 0,
        };
        info!(batch_id = %batch.id, total = batch.total, actor, "Bulk delete started");

        let mut last_failed = false;
        for (index, candidate_id) in ids.iter().copied().enumerate() {
            if index > 0 {
                let delay = if last_failed {
                    self.config.failure_delay
                } else {
                    self.config.delay
                };
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(batch_id = %batch.id, remaining = ids.len() - index, "Bulk delete cancelled");
                        for id in &ids[index..] {
                            batch.fail(*id, None, "batch cancelled".to_string(), true);
                        }
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            last_failed = false;

            let Some(candidate) = candidates.get(&candidate_id) else {
                batch.fail(
                    candidate_id,
                    None,
                    MaintenanceError::not_found("candidate", candidate_id).to_string(),
                    false,
                );
                on_progress(batch.progress(index, candidate_id, None, BulkItemStatus::Failed));
                continue;
            };
            on_progress(batch.progress(index, candidate_id, None, BulkItemStatus::Deleting));

            if batch.deleted_items.contains(&candidate.library_item_id) {
                debug!(candidate_id, item_id = candidate.library_item_id, "Item already deleted in this batch");
                batch.result.deleted += 1;
                on_progress(batch.progress(index, candidate_id, None, BulkItemStatus::Deleted));
                continue;
            }

            let outcome = self.pipeline.delete_candidate(candidate, actor).await;
            let title = outcome.item.as_ref().map(|i| i.title.clone());

            if outcome.is_success() {
                batch.consecutive_failures = 0;
                batch.record_success(&outcome);
                on_progress(batch.progress(index, candidate_id, title, BulkItemStatus::Deleted));
                if request.include_cross_server && outcome.removed_item() {
                    if let Some(item) = &outcome.item {
                        self.delete_cross_server_copies(&mut batch, candidate_id, item, actor).await;
                    }
                }
                continue;
            }

            if outcome.is_excluded() {
                batch.result.skipped += 1;
                on_progress(batch.progress(index, candidate_id, title, BulkItemStatus::Skipped));
                continue;
            }

            let error = outcome
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            batch.fail(candidate_id, outcome.item.as_ref(), error, false);
            on_progress(batch.progress(index, candidate_id, title, BulkItemStatus::Failed));

            if outcome.is_remote_failure() {
                last_failed = true;
                batch.consecutive_failures += 1;
                if batch.consecutive_failures >= self.config.max_consecutive_failures {
                    warn!(
                        batch_id = %batch.id,
                        failures = batch.consecutive_failures,
                        remaining = ids.len() - index - 1,
                        "Too many consecutive failures, aborting bulk delete"
                    );
                    for id in &ids[index + 1..] {
                        let item = candidates.get(id).map(|c| c.library_item_id);
                        batch.result.failed += 1;
                        batch.result.errors.push(BulkItemError {
                            candidate_id: *id,
                            library_item_id: item,
                            title: None,
                            error: format!(
                                "aborted after {} consecutive failures",
                                batch.consecutive_failures
                            ),
                            aborted: true,
                        });
                    }
                    break;
                }
            }
        }

        let result = batch.result;
        info!(
            batch_id = %batch.id,
            deleted = result.deleted,
            failed = result.failed,
            skipped = result.skipped,
            total_size = result.total_size,
            "Bulk delete finished"
        );
        Ok(result)
    }

    /// Delete copies of `item` on other servers. Copy failures are reported but do
    /// not feed the circuit breaker.
    async fn delete_cross_server_copies(
        &self,
        batch: &mut Batch,
        candidate_id: i64,
        item: &LibraryItemRecord,
        actor: &str,
    ) {
        let copies = match self
            .pipeline
            .db()
            .library_items()
            .find_cross_server_copies(item)
            .await
        {
            Ok(copies) => copies,
            Err(e) => {
                warn!(item_id = item.id, error = %e, "Cross-server lookup failed");
                batch
                    .result
                    .warnings
                    .push(format!("{}: cross-server lookup failed: {}", item.title, e));
                return;
            }
        };

        for copy in copies {
            let copy_id = copy.id;
            if !batch.deleted_items.insert(copy_id) {
                continue;
            }
            tokio::time::sleep(self.config.delay).await;

            let server_id = copy.server_id;
            let outcome = self.pipeline.delete_library_item(copy, None, actor).await;
            if outcome.is_success() {
                info!(item_id = item.id, copy_id, server_id, "Cross-server copy deleted");
                batch.record_success(&outcome);
            } else if outcome.is_excluded() {
                debug!(item_id = item.id, copy_id, server_id, "Cross-server copy is excluded");
                batch.deleted_items.remove(&copy_id);
                batch.result.skipped += 1;
            } else {
                batch.deleted_items.remove(&copy_id);
                let error = outcome
                    .error
                    .as_ref()
                    .map(|e| format!("cross-server copy on server {}: {}", server_id, e))
                    .unwrap_or_default();
                batch.fail(candidate_id, outcome.item.as_ref(), error, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeletionConfig;
    use crate::db::{Database, RuleCriterion, ServerRecord, UpsertCandidate, fixtures};
    use crate::services::media_server::fake::{FakeAdapter, FakeFactory};
    use crate::services::media_server::{AdapterRegistry, RemoteSeason};
    use assert_matches::assert_matches;
    use chrono::Utc;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config() -> BulkDeleteConfig {
        BulkDeleteConfig {
            delay: Duration::from_millis(1),
            failure_delay: Duration::from_millis(1),
            max_consecutive_failures: 3,
            max_batch: 500,
        }
    }

    fn orchestrator(db: &Database, servers: &[(&ServerRecord, Arc<FakeAdapter>)]) -> Arc<BulkDeleteOrchestrator> {
        let factory = Arc::new(FakeFactory::default());
        for (server, fake) in servers {
            factory.insert(server.id, fake.clone());
        }
        let registry = Arc::new(AdapterRegistry::new(factory));
        for (server, _) in servers {
            registry.connect(server).unwrap();
        }
        let deletion = DeletionConfig {
            remote_timeout: Duration::from_secs(5),
            db_timeout: Duration::from_secs(5),
            season_delay: Duration::from_millis(1),
            default_keep_seasons: 1,
        };
        let pipeline = Arc::new(DeletionPipeline::new(db.clone(), registry, Vec::new(), deletion));
        Arc::new(BulkDeleteOrchestrator::new(pipeline, config()))
    }

    /// Candidate ids of `items` under `rule_id`, in item order
    async fn candidates(db: &Database, rule_id: i64, items: &[LibraryItemRecord]) -> Vec<i64> {
        let input: Vec<UpsertCandidate> = items
            .iter()
            .map(|i| UpsertCandidate { library_item_id: i.id, reason: "old".to_string() })
            .collect();
        db.candidates().replace_for_rule(rule_id, &input, Utc::now()).await.unwrap();
        let rows = db.candidates().list_rows_for_rule(rule_id).await.unwrap();
        items
            .iter()
            .map(|i| rows.iter().find(|r| r.library_item_id == i.id).unwrap().id)
            .collect()
    }

    fn seasons(ids: &[&str]) -> Vec<RemoteSeason> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RemoteSeason {
                id: id.to_string(),
                index: i as i32 + 1,
                title: format!("Season {}", i + 1),
                added_at: None,
            })
            .collect()
    }

    fn request(ids: Vec<i64>) -> BulkDeleteRequest {
        BulkDeleteRequest { candidate_ids: ids, include_cross_server: false }
    }

    #[tokio::test]
    async fn test_second_reference_to_same_item_is_deduplicated() {
        let db = Database::in_memory().await.unwrap();
        let (server, items) = fixtures::library(&db, &["Alien"]).await;
        let first = fixtures::rule(&db, RuleCriterion::UnwatchedMovie, &items).await;
        let second = fixtures::rule(&db, RuleCriterion::LowResolution, &items).await;
        let mut ids = candidates(&db, first.id, &items).await;
        ids.extend(candidates(&db, second.id, &items).await);
        let fake = Arc::new(FakeAdapter::new(&server.machine_id));
        let bulk = orchestrator(&db, &[(&server, fake.clone())]);

        let result = bulk
            .execute_bulk_delete(&request(ids), "sam", &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(result.deleted, 2);
        assert_eq!(result.failed, 0);
        assert_eq!(result.total_size, items[0].file_size);
        assert_eq!(fake.delete_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_aborts_after_three_failures() {
        let db = Database::in_memory().await.unwrap();
        let (server, items) = fixtures::library(&db, &["A", "B", "C", "D", "E"]).await;
        let rule = fixtures::rule(&db, RuleCriterion::UnwatchedMovie, &items).await;
        let ids = candidates(&db, rule.id, &items).await;
        let fake = Arc::new(FakeAdapter::new(&server.machine_id));
        fake.fail_all_deletes();
        let bulk = orchestrator(&db, &[(&server, fake.clone())]);

        let result = bulk
            .execute_bulk_delete(&request(ids.clone()), "sam", &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(fake.delete_calls().len(), 3);
        assert_eq!(result.deleted, 0);
        assert_eq!(result.failed, 5);
        let aborted: Vec<i64> = result.errors.iter().filter(|e| e.aborted).map(|e| e.candidate_id).collect();
        assert_eq!(aborted, ids[3..].to_vec());
    }

    #[tokio::test]
    async fn test_success_resets_breaker_and_missing_candidates_do_not_trip_it() {
        let db = Database::in_memory().await.unwrap();
        let (server, items) = fixtures::library(&db, &["A", "B", "C", "D"]).await;
        let rule = fixtures::rule(&db, RuleCriterion::UnwatchedMovie, &items).await;
        let ids = candidates(&db, rule.id, &items).await;
        let fake = Arc::new(FakeAdapter::new(&server.machine_id));
        fake.fail_delete("m0");
        fake.fail_delete("m1");
        fake.fail_delete("m3");
        let bulk = orchestrator(&db, &[(&server, fake.clone())]);

        let input = vec![ids[0], ids[1], 9999, ids[2], ids[3]];
        let result = bulk
            .execute_bulk_delete(&request(input), "sam", &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(fake.delete_calls().len(), 4);
        assert_eq!(result.deleted, 1);
        assert_eq!(result.failed, 4);
        assert!(result.errors.iter().all(|e| !e.aborted));
    }

    #[tokio::test]
    async fn test_excluded_items_are_skipped() {
        let db = Database::in_memory().await.unwrap();
        let (server, items) = fixtures::library(&db, &["A", "B"]).await;
        let rule = fixtures::rule(&db, RuleCriterion::UnwatchedMovie, &items).await;
        let ids = candidates(&db, rule.id, &items).await;
        let fake = Arc::new(FakeAdapter::new(&server.machine_id));
        let bulk = orchestrator(&db, &[(&server, fake.clone())]);
        // an exclusion that lands after the candidate was listed
        sqlx::query(
            "INSERT INTO maintenance_exclusions (rule_id, library_item_id, excluded_by, created_at) VALUES (NULL, ?, 'sam', ?)",
        )
        .bind(items[0].id)
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap();

        let result = bulk
            .execute_bulk_delete(&request(ids), "sam", &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(result.deleted, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.failed, 0);
        assert_eq!(fake.delete_calls(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_cross_server_copies_are_deleted() {
        let db = Database::in_memory().await.unwrap();
        let plex = fixtures::server(&db, "Plex").await;
        let other = fixtures::server(&db, "Jelly").await;
        let mut movie = fixtures::movie("p1", "Alien");
        movie.tmdb_id = Some("348".to_string());
        let items = fixtures::insert(&db, &plex, &[movie.clone()]).await;
        movie.item_id = "j1".to_string();
        let copies = fixtures::insert(&db, &other, &[movie]).await;
        let rule = fixtures::rule(&db, RuleCriterion::UnwatchedMovie, &items).await;
        let ids = candidates(&db, rule.id, &items).await;
        let plex_fake = Arc::new(FakeAdapter::new(&plex.machine_id));
        let other_fake = Arc::new(FakeAdapter::new(&other.machine_id));
        let bulk = orchestrator(&db, &[(&plex, plex_fake.clone()), (&other, other_fake.clone())]);

        let req = BulkDeleteRequest { candidate_ids: ids, include_cross_server: true };
        let result = bulk
            .execute_bulk_delete(&req, "sam", &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(result.deleted, 2);
        assert_eq!(result.total_size, items[0].file_size * 2);
        assert_eq!(plex_fake.delete_calls(), vec!["p1".to_string()]);
        assert_eq!(other_fake.delete_calls(), vec!["j1".to_string()]);
        assert!(db.library_items().get(copies[0].id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_season_trim_does_not_count_as_whole_show_delete() {
        let db = Database::in_memory().await.unwrap();
        let server = fixtures::server(&db, "Plex").await;
        let items = fixtures::insert(&db, &server, &[fixtures::show("s1", "Lost", 3)]).await;
        let trim = fixtures::rule(&db, RuleCriterion::KeepLatestSeasons, &items).await;
        let unwatched = fixtures::rule(&db, RuleCriterion::UnwatchedShow, &items).await;
        let mut ids = candidates(&db, trim.id, &items).await;
        ids.extend(candidates(&db, unwatched.id, &items).await);
        let fake = Arc::new(FakeAdapter::new(&server.machine_id));
        fake.set_seasons("s1", seasons(&["a", "b", "c"]));
        let bulk = orchestrator(&db, &[(&server, fake.clone())]);

        let result = bulk
            .execute_bulk_delete(&request(ids), "sam", &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(result.deleted, 2);
        assert_eq!(result.failed, 0);
        // the trim keeps the show, so the second candidate still deletes it
        assert_eq!(
            fake.delete_calls(),
            vec!["a".to_string(), "b".to_string(), "s1".to_string()]
        );
        assert!(db.library_items().get(items[0].id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_season_trim_leaves_cross_server_copies_alone() {
        let db = Database::in_memory().await.unwrap();
        let plex = fixtures::server(&db, "Plex").await;
        let other = fixtures::server(&db, "Jelly").await;
        let mut show = fixtures::show("s1", "Lost", 3);
        show.tvdb_id = Some("73739".to_string());
        let items = fixtures::insert(&db, &plex, &[show.clone()]).await;
        show.item_id = "j1".to_string();
        let copies = fixtures::insert(&db, &other, &[show]).await;
        let rule = fixtures::rule(&db, RuleCriterion::KeepLatestSeasons, &items).await;
        let ids = candidates(&db, rule.id, &items).await;
        let plex_fake = Arc::new(FakeAdapter::new(&plex.machine_id));
        plex_fake.set_seasons("s1", seasons(&["a", "b", "c"]));
        let other_fake = Arc::new(FakeAdapter::new(&other.machine_id));
        let bulk = orchestrator(&db, &[(&plex, plex_fake.clone()), (&other, other_fake.clone())]);

        let req = BulkDeleteRequest { candidate_ids: ids, include_cross_server: true };
        let result = bulk
            .execute_bulk_delete(&req, "sam", &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(result.deleted, 1);
        assert_eq!(plex_fake.delete_calls(), vec!["a".to_string(), "b".to_string()]);
        assert!(other_fake.delete_calls().is_empty());
        assert!(db.library_items().get(copies[0].id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_batches() {
        let db = Database::in_memory().await.unwrap();
        let server = fixtures::server(&db, "Plex").await;
        let fake = Arc::new(FakeAdapter::new(&server.machine_id));
        let bulk = orchestrator(&db, &[(&server, fake)]);

        assert_matches!(bulk.validate(&request(vec![])), Err(MaintenanceError::Validation(_)));
        assert_matches!(bulk.validate(&request(vec![1, 1])), Err(MaintenanceError::Validation(_)));
        assert_matches!(bulk.validate(&request(vec![-1])), Err(MaintenanceError::Validation(_)));
        let too_many: Vec<i64> = (1..=501).collect();
        assert_matches!(bulk.validate(&request(too_many)), Err(MaintenanceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancellation_stops_at_pacing_sleep() {
        let db = Database::in_memory().await.unwrap();
        let (server, items) = fixtures::library(&db, &["A", "B", "C"]).await;
        let rule = fixtures::rule(&db, RuleCriterion::UnwatchedMovie, &items).await;
        let ids = candidates(&db, rule.id, &items).await;
        let fake = Arc::new(FakeAdapter::new(&server.machine_id));
        let bulk = orchestrator(&db, &[(&server, fake.clone())]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = bulk
            .execute_bulk_delete(&request(ids), "sam", &cancel, |_| {})
            .await
            .unwrap();

        assert_eq!(result.deleted, 1);
        assert_eq!(result.failed, 2);
        assert_eq!(fake.delete_calls(), vec!["m0".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_reports_progress_then_complete() {
        let db = Database::in_memory().await.unwrap();
        let (server, items) = fixtures::library(&db, &["A", "B"]).await;
        let rule = fixtures::rule(&db, RuleCriterion::UnwatchedMovie, &items).await;
        let ids = candidates(&db, rule.id, &items).await;
        let fake = Arc::new(FakeAdapter::new(&server.machine_id));
        let bulk = orchestrator(&db, &[(&server, fake)]);

        let mut rx = bulk
            .stream(request(ids), "sam".to_string(), CancellationToken::new())
            .unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        let progress = events.iter().filter(|e| matches!(e, BulkEvent::Progress(_))).count();
        assert_eq!(progress, 4);
        assert_matches!(events.last(), Some(BulkEvent::Complete(result)) if result.deleted == 2);
    }

    #[tokio::test]
    async fn test_progress_callback_sees_every_item() {
        let db = Database::in_memory().await.unwrap();
        let (server, items) = fixtures::library(&db, &["A"]).await;
        let rule = fixtures::rule(&db, RuleCriterion::UnwatchedMovie, &items).await;
        let ids = candidates(&db, rule.id, &items).await;
        let fake = Arc::new(FakeAdapter::new(&server.machine_id));
        let bulk = orchestrator(&db, &[(&server, fake)]);
        let seen = Mutex::new(Vec::new());

        bulk.execute_bulk_delete(&request(ids), "sam", &CancellationToken::new(), |p| {
            seen.lock().push(p.status)
        })
        .await
        .unwrap();

        assert_eq!(*seen.lock(), vec![BulkItemStatus::Deleting, BulkItemStatus::Deleted]);
    }
}
