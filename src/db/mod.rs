//! Database connection and repositories
//!
//! All state lives in a single SQLite database. Repositories are cheap handles
//! over the shared pool and are obtained from [Database].

pub mod audit;
pub mod candidates;
pub mod exclusions;
#[cfg(test)]
pub mod fixtures;
pub mod library_items;
pub mod rules;
pub mod schema;
pub mod servers;
pub mod sqlite_helpers;
pub mod watch_history;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

pub use audit::{AuditRepository, CreateAuditRecord, PaginatedAudit};
pub use candidates::{
    CandidateListQuery, CandidateRecord, CandidateRepository, CandidateSort, PaginatedCandidates,
    UpsertCandidate,
};
pub use exclusions::{ExclusionRepository, PaginatedExclusions};
pub use library_items::{LibraryItemRecord, LibraryItemRepository, MediaType, UpsertLibraryItem};
pub use rules::{
    CreateRule, MaintenanceRuleRecord, RuleCriterion, RuleRepository, RuleScope, UpdateRule,
};
pub use servers::{CreateServer, ServerRecord, ServerRepository, ServerType, UpdateServer};
pub use watch_history::{CreateWatchEvent, WatchHistoryRepository, WatchSummary};

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Get the maximum connection pool size from environment or default
    fn get_max_connections() -> u32 {
        std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10)
    }

    /// Open (creating if needed) the SQLite database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database url: {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::get_max_connections())
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        Ok(Self { pool })
    }

    /// Connect with retry until `timeout` elapses.
    pub async fn connect_with_retry(url: &str, timeout: Duration) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match Self::connect(url).await {
                Ok(db) => return Ok(db),
                Err(e) if tokio::time::Instant::now() < deadline => {
                    tracing::warn!(error = %e, "Database connection failed, retrying in 2 seconds");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(test)]
    /// Private in-memory database with the schema applied. A single connection is
    /// kept alive for the life of the pool, otherwise the data would vanish.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes that do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        schema::apply(&self.pool).await
    }

    /// Close all pooled connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get a media server repository
    pub fn servers(&self) -> ServerRepository {
        ServerRepository::new(self.pool.clone())
    }

    /// Get a library cache repository
    pub fn library_items(&self) -> LibraryItemRepository {
        LibraryItemRepository::new(self.pool.clone())
    }

    /// Get a watch history repository
    pub fn watch_history(&self) -> WatchHistoryRepository {
        WatchHistoryRepository::new(self.pool.clone())
    }

    /// Get a maintenance rule repository
    pub fn rules(&self) -> RuleRepository {
        RuleRepository::new(self.pool.clone())
    }

    /// Get a maintenance candidate repository
    pub fn candidates(&self) -> CandidateRepository {
        CandidateRepository::new(self.pool.clone())
    }

    /// Get an exclusion repository
    pub fn exclusions(&self) -> ExclusionRepository {
        ExclusionRepository::new(self.pool.clone())
    }

    /// Get a deletion audit log repository
    pub fn audit(&self) -> AuditRepository {
        AuditRepository::new(self.pool.clone())
    }
}
