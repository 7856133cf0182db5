//! Background job scheduling
//!
//! A single cron job keeps the library cache fresh: every run starts a sync for
//! each movie and show library of every active server. Keys that are already
//! syncing are skipped by the sync manager.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::db::Database;
use crate::services::manager::{Service, ServiceHealth};
use crate::services::sync::SyncManager;

/// Start a sync for every library of every active server. Returns how many
/// library syncs were started.
pub async fn run_scheduled_sync(db: &Database, sync: &SyncManager) -> Result<usize> {
    let servers = db.servers().list_active().await?;
    let mut started = 0;
    for server in servers {
        match sync.start_server_sync(server.id).await {
            Ok(libraries) => started += libraries.len(),
            Err(e) => warn!(server_id = server.id, error = %e, "Scheduled sync skipped server"),
        }
    }
    Ok(started)
}

pub struct SchedulerService {
    db: Database,
    sync: Arc<SyncManager>,
    cron: String,
    scheduler: Mutex<Option<JobScheduler>>,
}

impl SchedulerService {
    pub fn new(db: Database, sync: Arc<SyncManager>, cron: &str) -> Self {
        Self {
            db,
            sync,
            cron: cron.to_string(),
            scheduler: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Service for SchedulerService {
    fn name(&self) -> &str {
        "scheduler"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["sync".to_string()]
    }

    async fn start(&self) -> Result<()> {
        let scheduler = JobScheduler::new().await?;

        let db = self.db.clone();
        let sync = self.sync.clone();
        let sync_job = Job::new_async(self.cron.as_str(), move |_uuid, _l| {
            let db = db.clone();
            let sync = sync.clone();
            Box::pin(async move {
                info!("Running scheduled library sync");
                match run_scheduled_sync(&db, &sync).await {
                    Ok(started) => info!(started, "Scheduled library sync dispatched"),
                    Err(e) => error!("Scheduled sync error: {:#}", e),
                }
            })
        })
        .with_context(|| format!("Invalid SYNC_CRON expression: {}", self.cron))?;
        scheduler.add(sync_job).await?;
        scheduler.start().await?;

        *self.scheduler.lock().await = Some(scheduler);
        info!(service = "scheduler", cron = %self.cron, "Job scheduler started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await?;
        }
        info!(service = "scheduler", "Job scheduler stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        if self.scheduler.lock().await.is_some() {
            Ok(ServiceHealth::healthy())
        } else {
            Ok(ServiceHealth::unhealthy("scheduler not running"))
        }
    }
}
