//! Application configuration management

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (for logging the listen address)
    pub host: Option<String>,

    /// Server port
    pub port: u16,

    /// SQLite database URL or path
    pub database_url: String,

    /// Cron expression for the scheduled library sync
    pub sync_cron: String,

    /// Hard limit on one sync job
    pub sync_job_timeout: Duration,

    pub bulk_delete: BulkDeleteConfig,

    pub deletion: DeletionConfig,

    /// Sonarr base URL; the cascade hook is disabled when unset
    pub sonarr_url: Option<String>,

    pub sonarr_api_key: Option<String>,

    /// TTL of resolver cache entries (admin users, series index)
    pub resolver_cache_ttl: Duration,
}

/// Pacing and circuit breaking for bulk deletes
#[derive(Debug, Clone)]
pub struct BulkDeleteConfig {
    /// Delay between items
    pub delay: Duration,
    /// Delay after a failed remote delete
    pub failure_delay: Duration,
    /// Consecutive remote failures that abort the batch
    pub max_consecutive_failures: u32,
    /// Largest accepted batch
    pub max_batch: usize,
}

/// Per-step limits of the deletion pipeline
#[derive(Debug, Clone)]
pub struct DeletionConfig {
    pub remote_timeout: Duration,
    pub db_timeout: Duration,
    /// Pause between season deletes of one show
    pub season_delay: Duration,
    /// Seasons kept when a rule does not say
    pub default_keep_seasons: u32,
}

impl Default for BulkDeleteConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            failure_delay: Duration::from_secs(3),
            max_consecutive_failures: 3,
            max_batch: 500,
        }
    }
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(30),
            db_timeout: Duration::from_secs(10),
            season_delay: Duration::from_millis(250),
            default_keep_seasons: 1,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            port: 3001,
            database_url: "sqlite://./data/cullarr.db".to_string(),
            sync_cron: "0 0 */6 * * *".to_string(),
            sync_job_timeout: Duration::from_secs(30 * 60),
            bulk_delete: BulkDeleteConfig::default(),
            deletion: DeletionConfig::default(),
            sonarr_url: None,
            sonarr_api_key: None,
            resolver_cache_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// Parse an optional variable, falling back to `default` when unset
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        _ => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let database_url = env::var("DATABASE_PATH")
            .map(|path| {
                if path.starts_with("sqlite:") {
                    path
                } else {
                    format!("sqlite://{}", path)
                }
            })
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or(defaults.database_url);

        let bulk_defaults = BulkDeleteConfig::default();
        let bulk_delete = BulkDeleteConfig {
            delay: Duration::from_millis(env_or(
                "BULK_DELETE_DELAY_MS",
                bulk_defaults.delay.as_millis() as u64,
            )?),
            failure_delay: Duration::from_millis(env_or(
                "BULK_DELETE_FAILURE_DELAY_MS",
                bulk_defaults.failure_delay.as_millis() as u64,
            )?),
            max_consecutive_failures: env_or(
                "BULK_DELETE_MAX_FAILURES",
                bulk_defaults.max_consecutive_failures,
            )?
            .max(1),
            max_batch: bulk_defaults.max_batch,
        };

        let deletion_defaults = DeletionConfig::default();
        let deletion = DeletionConfig {
            remote_timeout: Duration::from_secs(env_or(
                "REMOTE_DELETE_TIMEOUT_SECS",
                deletion_defaults.remote_timeout.as_secs(),
            )?),
            db_timeout: Duration::from_secs(env_or(
                "DB_STEP_TIMEOUT_SECS",
                deletion_defaults.db_timeout.as_secs(),
            )?),
            season_delay: Duration::from_millis(env_or(
                "SEASON_DELETE_DELAY_MS",
                deletion_defaults.season_delay.as_millis() as u64,
            )?),
            default_keep_seasons: deletion_defaults.default_keep_seasons,
        };

        Ok(Self {
            host: env::var("HOST").ok(),

            port: env_or("PORT", defaults.port)?,

            database_url,

            sync_cron: env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),

            sync_job_timeout: Duration::from_secs(env_or(
                "SYNC_JOB_TIMEOUT_SECS",
                defaults.sync_job_timeout.as_secs(),
            )?),

            bulk_delete,

            deletion,

            sonarr_url: env::var("SONARR_URL").ok().filter(|v| !v.trim().is_empty()),

            sonarr_api_key: env::var("SONARR_API_KEY").ok().filter(|v| !v.trim().is_empty()),

            resolver_cache_ttl: Duration::from_secs(env_or(
                "RESOLVER_CACHE_TTL_SECS",
                defaults.resolver_cache_ttl.as_secs(),
            )?),
        })
    }
}
