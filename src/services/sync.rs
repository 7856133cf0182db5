//! Library sync orchestrator
//!
//! Mirrors one remote library into the local cache: fetch every item, merge
//! local watch history, upsert and sweep in one transaction, then re-evaluate
//! the rules scoped to that library.
//!
//! At most one job runs per (server, library) key. Each job sends progress over
//! an mpsc channel to a single relay task, which keeps the polled snapshot and
//! forwards events to live subscribers. The relay also awaits the job handle, so
//! a panicking job still publishes a terminal result and releases its key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{Database, ServerRecord, UpsertLibraryItem};
use crate::error::{MaintenanceError, MaintenanceResult};
use crate::services::maintenance::RuleEvaluator;
use crate::services::manager::{Service, ServiceHealth};
use crate::services::media_server::{AdapterRegistry, MediaServerAdapter};
use crate::services::servers::ServerService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Fetching,
    MatchingHistory,
    Saving,
    Evaluating,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub server_id: i64,
    pub library_id: String,
    pub phase: SyncPhase,
    pub current: usize,
    pub total: usize,
}

/// Terminal result of a sync job
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub server_id: i64,
    pub library_id: String,
    pub synced: u64,
    pub deleted: u64,
    pub candidates: usize,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Progress(SyncProgress),
    Complete(SyncResult),
}

/// What `status()` reports for one key
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncJobStatus {
    Running {
        started_at: DateTime<Utc>,
        progress: Option<SyncProgress>,
    },
    Finished {
        result: SyncResult,
    },
}

/// Returned by [SyncManager::subscribe]
pub enum SyncSubscription {
    Finished(SyncResult),
    Running {
        snapshot: Option<SyncProgress>,
        events: broadcast::Receiver<SyncEvent>,
    },
}

type SyncKey = (i64, String);

struct SyncJob {
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    progress: Option<SyncProgress>,
    result: Option<SyncResult>,
    events: broadcast::Sender<SyncEvent>,
}

type JobTable = Arc<Mutex<HashMap<SyncKey, SyncJob>>>;

pub struct SyncManager {
    db: Database,
    registry: Arc<AdapterRegistry>,
    evaluator: RuleEvaluator,
    jobs: JobTable,
    shutdown: CancellationToken,
    job_timeout: Duration,
}

impl SyncManager {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        evaluator: RuleEvaluator,
        shutdown: CancellationToken,
        job_timeout: Duration,
    ) -> Self {
        Self {
            db,
            registry,
            evaluator,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            job_timeout,
        }
    }

    /// Start syncing one library. Fails with a conflict when a job for the key is
    /// already running.
    pub async fn start_sync(&self, server_id: i64, library_id: &str) -> MaintenanceResult<()> {
        let server = self
            .db
            .servers()
            .get(server_id)
            .await?
            .ok_or_else(|| MaintenanceError::not_found("server", server_id))?;
        if !server.is_active() {
            return Err(MaintenanceError::NotConfigured(server_id));
        }
        let adapter = self
            .registry
            .get_server(server_id)
            .ok_or(MaintenanceError::NotConfigured(server_id))?;

        let key: SyncKey = (server_id, library_id.to_string());
        let cancel = self.shutdown.child_token();
        {
            let mut jobs = self.jobs.lock();
            if jobs.get(&key).is_some_and(|job| job.result.is_none()) {
                return Err(MaintenanceError::Conflict(format!(
                    "a sync of library {} on server {} is already running",
                    library_id, server_id
                )));
            }
            let (events, _) = broadcast::channel(64);
            jobs.insert(
                key.clone(),
                SyncJob {
                    started_at: Utc::now(),
                    cancel: cancel.clone(),
                    progress: None,
                    result: None,
                    events,
                },
            );
        }

        info!(server_id, library_id, "Library sync started");
        let (tx, rx) = mpsc::channel(32);
        let job = SyncJobContext {
            db: self.db.clone(),
            adapter,
            evaluator: self.evaluator.clone(),
            server,
            library_id: library_id.to_string(),
            progress: tx,
        };
        let handle = tokio::spawn(job.run(cancel, self.job_timeout));
        tokio::spawn(relay(self.jobs.clone(), key, rx, handle));
        Ok(())
    }

    /// Start a sync for every movie or show library of a server. Keys that are
    /// already running are skipped. Returns the library ids that were started.
    pub async fn start_server_sync(&self, server_id: i64) -> MaintenanceResult<Vec<String>> {
        let adapter = self
            .registry
            .get_server(server_id)
            .ok_or(MaintenanceError::NotConfigured(server_id))?;
        let libraries = adapter
            .get_libraries()
            .await
            .map_err(|e| MaintenanceError::upstream("list libraries", format!("{:#}", e)))?;

        let mut started = Vec::new();
        for library in libraries.into_iter().filter(|l| l.media_type.is_some()) {
            match self.start_sync(server_id, &library.id).await {
                Ok(()) => started.push(library.id),
                Err(MaintenanceError::Conflict(_)) => {
                    debug!(server_id, library_id = %library.id, "Sync already running, skipping")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    /// Snapshot every tracked job. Finished jobs are reported once, then forgotten.
    pub fn status(&self) -> HashMap<String, SyncJobStatus> {
        let mut jobs = self.jobs.lock();
        let snapshot = jobs
            .iter()
            .map(|((server_id, library_id), job)| {
                let status = match &job.result {
                    Some(result) => SyncJobStatus::Finished {
                        result: result.clone(),
                    },
                    None => SyncJobStatus::Running {
                        started_at: job.started_at,
                        progress: job.progress.clone(),
                    },
                };
                (format!("{}:{}", server_id, library_id), status)
            })
            .collect();
        jobs.retain(|_, job| job.result.is_none());
        snapshot
    }

    #[cfg(test)]
    pub fn is_running(&self, server_id: i64, library_id: &str) -> bool {
        self.jobs
            .lock()
            .get(&(server_id, library_id.to_string()))
            .is_some_and(|job| job.result.is_none())
    }

    /// Live progress for one key, or its result if it already finished
    pub fn subscribe(&self, server_id: i64, library_id: &str) -> Option<SyncSubscription> {
        let jobs = self.jobs.lock();
        let job = jobs.get(&(server_id, library_id.to_string()))?;
        Some(match &job.result {
            Some(result) => SyncSubscription::Finished(result.clone()),
            None => SyncSubscription::Running {
                snapshot: job.progress.clone(),
                events: job.events.subscribe(),
            },
        })
    }

    /// Cancel every running job of a server. Used before its configuration changes.
    pub fn cancel_server(&self, server_id: i64) -> usize {
        let jobs = self.jobs.lock();
        let mut cancelled = 0;
        for ((id, library_id), job) in jobs.iter() {
            if *id == server_id && job.result.is_none() {
                job.cancel.cancel();
                cancelled += 1;
                info!(server_id, library_id, "Library sync cancelled");
            }
        }
        cancelled
    }
}

/// Lifecycle of the sync subsystem. Adapters for every active server are
/// registered on start; stop cancels the process-wide token so running jobs
/// exit before they commit.
pub struct SyncService {
    servers: Arc<ServerService>,
    shutdown: CancellationToken,
}

impl SyncService {
    pub fn new(servers: Arc<ServerService>, shutdown: CancellationToken) -> Self {
        Self { servers, shutdown }
    }
}

#[async_trait]
impl Service for SyncService {
    fn name(&self) -> &str {
        "sync"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["database".to_string()]
    }

    async fn start(&self) -> anyhow::Result<()> {
        let connected = self.servers.connect_all().await?;
        info!(service = "sync", connected, "Sync service started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        info!(service = "sync", "Running syncs cancelled");
        Ok(())
    }

    async fn health(&self) -> anyhow::Result<ServiceHealth> {
        if self.shutdown.is_cancelled() {
            return Ok(ServiceHealth::degraded("shutting down"));
        }
        Ok(ServiceHealth::healthy())
    }
}

/// Consume a job's progress, then publish its terminal result
async fn relay(
    jobs: JobTable,
    key: SyncKey,
    mut rx: mpsc::Receiver<SyncProgress>,
    handle: JoinHandle<MaintenanceResult<SyncResult>>,
) {
    while let Some(progress) = rx.recv().await {
        let mut jobs = jobs.lock();
        if let Some(job) = jobs.get_mut(&key) {
            let _ = job.events.send(SyncEvent::Progress(progress.clone()));
            job.progress = Some(progress);
        }
    }

    let (server_id, library_id) = key.clone();
    let result = match handle.await {
        Ok(Ok(result)) => {
            info!(
                server_id,
                library_id = %library_id,
                synced = result.synced,
                deleted = result.deleted,
                candidates = result.candidates,
                "Library sync finished"
            );
            result
        }
        Ok(Err(e)) => {
            warn!(server_id, library_id = %library_id, error = %e, "Library sync failed");
            failed_result(server_id, library_id, e.to_string())
        }
        Err(e) => {
            error!(server_id, library_id = %library_id, error = %e, "Library sync task panicked");
            failed_result(server_id, library_id, "internal error".to_string())
        }
    };

    let mut jobs = jobs.lock();
    if let Some(job) = jobs.get_mut(&key) {
        let _ = job.events.send(SyncEvent::Complete(result.clone()));
        job.result = Some(result);
    }
}

fn cancelled() -> MaintenanceError {
    MaintenanceError::Conflict("sync cancelled before it could commit".to_string())
}

fn failed_result(server_id: i64, library_id: String, error: String) -> SyncResult {
    SyncResult {
        server_id,
        library_id,
        synced: 0,
        deleted: 0,
        candidates: 0,
        error: Some(error),
        finished_at: Utc::now(),
    }
}

/// Everything one job needs, moved onto its task
struct SyncJobContext {
    db: Database,
    adapter: Arc<dyn MediaServerAdapter>,
    evaluator: RuleEvaluator,
    server: ServerRecord,
    library_id: String,
    progress: mpsc::Sender<SyncProgress>,
}

impl SyncJobContext {
    async fn report(&self, phase: SyncPhase, current: usize, total: usize) {
        let _ = self
            .progress
            .send(SyncProgress {
                server_id: self.server.id,
                library_id: self.library_id.clone(),
                phase,
                current,
                total,
            })
            .await;
    }

    /// Fetch, verify and merge under `cancel` and `timeout`; once the write has
    /// committed the job always reports what it wrote.
    async fn run(self, cancel: CancellationToken, timeout: Duration) -> MaintenanceResult<SyncResult> {
        let server_id = self.server.id;

        let items = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            prepared = tokio::time::timeout(timeout, self.prepare()) => {
                prepared.unwrap_or(Err(MaintenanceError::Timeout("library sync")))?
            }
        };
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let total = items.len();

        self.report(SyncPhase::Saving, 0, total).await;
        let written = self
            .db
            .library_items()
            .replace_library(server_id, &self.library_id, &items, Utc::now())
            .await?;
        self.report(SyncPhase::Saving, total, total).await;

        self.report(SyncPhase::Evaluating, 0, 0).await;
        let (candidates, error) = match self
            .evaluator
            .refresh_library(server_id, &self.library_id)
            .await
        {
            Ok(candidates) => (candidates, None),
            Err(e) => {
                warn!(server_id, library_id = %self.library_id, error = %e, "Rule evaluation after sync failed");
                (0, Some(format!("library saved, but rule evaluation failed: {}", e)))
            }
        };
        self.report(SyncPhase::Evaluating, candidates, candidates).await;

        Ok(SyncResult {
            server_id,
            library_id: self.library_id,
            synced: written.upserted,
            deleted: written.deleted,
            candidates,
            error,
            finished_at: Utc::now(),
        })
    }

    /// Everything before the write: fetch, identity re-check, history merge
    async fn prepare(&self) -> MaintenanceResult<Vec<UpsertLibraryItem>> {
        let server_id = self.server.id;

        self.report(SyncPhase::Fetching, 0, 0).await;
        let mut items = self
            .adapter
            .get_library_items(&self.library_id)
            .await
            .map_err(|e| MaintenanceError::upstream("fetch library items", format!("{:#}", e)))?;
        let total = items.len();
        self.report(SyncPhase::Fetching, total, total).await;

        self.verify_identity().await?;

        self.report(SyncPhase::MatchingHistory, 0, total).await;
        let history = self.db.watch_history().summaries_for_server(server_id).await?;
        let matched = merge_history(&mut items, &history);
        debug!(server_id, library_id = %self.library_id, matched, "Watch history merged");
        self.report(SyncPhase::MatchingHistory, total, total).await;

        Ok(items)
    }

    /// Abort when the server was deleted, disabled or re-pointed while fetching
    async fn verify_identity(&self) -> MaintenanceResult<()> {
        let current = self.db.servers().get(self.server.id).await?;
        let unchanged = current.is_some_and(|server| {
            server.is_active() && server.identity() == self.server.identity()
        });
        if unchanged {
            Ok(())
        } else {
            Err(MaintenanceError::Conflict(
                "server configuration changed during sync, nothing was saved".to_string(),
            ))
        }
    }
}

/// Raise play counts and last-watched times from locally recorded history.
/// Returns the number of items that had history.
fn merge_history(
    items: &mut [UpsertLibraryItem],
    history: &HashMap<String, crate::db::WatchSummary>,
) -> usize {
    let mut matched = 0;
    for item in items.iter_mut() {
        let Some(summary) = history.get(&item.item_id) else {
            continue;
        };
        matched += 1;
        let plays = i32::try_from(summary.plays).unwrap_or(i32::MAX);
        item.play_count = item.play_count.max(plays);
        item.last_watched_at = match item.last_watched_at {
            Some(remote) if remote >= summary.last_watched_at => Some(remote),
            _ => Some(summary.last_watched_at),
        };
    }
    matched
}
