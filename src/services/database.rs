//! Database service: wraps the SQLite pool for lifecycle (start/stop/health) and dependencies.
//!
//! Services that read or write the cache declare `dependencies: ["database"]`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::query;
use tracing::{info, warn};

use crate::db::Database;
use crate::services::manager::{Service, ServiceHealth};

/// Configuration for the database service.
#[derive(Debug, Clone)]
pub struct DatabaseServiceConfig {
    /// SQLite connection URL (e.g. `sqlite://./data/cullarr.db`).
    pub database_url: String,
    /// How long to retry connecting before giving up.
    pub connect_timeout: Duration,
}

impl Default for DatabaseServiceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/cullarr.db".to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Owns the database handle. Register this first so that services depending on
/// `"database"` start after the schema is in place.
pub struct DatabaseService {
    db: Database,
}

impl DatabaseService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Connect (with retry) using `config`.
    pub async fn from_config(config: DatabaseServiceConfig) -> Result<Self> {
        if let Some(path) = config
            .database_url
            .strip_prefix("sqlite://")
            .filter(|p| !p.starts_with(':'))
        {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
            }
        }
        let db = Database::connect_with_retry(&config.database_url, config.connect_timeout)
            .await
            .context("Database service: connect_with_retry failed")?;
        Ok(Self::new(db))
    }

    /// Valid until [Service::stop] is called.
    pub fn db(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl Service for DatabaseService {
    fn name(&self) -> &str {
        "database"
    }

    async fn start(&self) -> Result<()> {
        info!(service = "database", "Database service starting");
        query("SELECT 1").execute(self.db.pool()).await?;
        self.db.migrate().await.context("Schema migration failed")?;
        info!(service = "database", "Database service started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.db.close().await;
        info!(service = "database", "Database service stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        match query("SELECT 1").execute(self.db.pool()).await {
            Ok(_) => Ok(ServiceHealth::healthy()),
            Err(e) => {
                warn!(service = "database", error = %e, "Health check failed");
                Ok(ServiceHealth::unhealthy(e.to_string()))
            }
        }
    }
}
