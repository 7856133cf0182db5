//! Media server database repository

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// Kind of media server behind a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ServerType {
    Plex,
    Jellyfin,
    Emby,
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerType::Plex => write!(f, "plex"),
            ServerType::Jellyfin => write!(f, "jellyfin"),
            ServerType::Emby => write!(f, "emby"),
        }
    }
}

impl std::str::FromStr for ServerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "plex" => Ok(ServerType::Plex),
            "jellyfin" => Ok(ServerType::Jellyfin),
            "emby" => Ok(ServerType::Emby),
            _ => Err(anyhow::anyhow!("Unknown server type: {}", s)),
        }
    }
}

/// Media server record from database
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ServerRecord {
    pub id: i64,
    pub name: String,
    pub server_type: ServerType,
    pub url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub machine_id: String,
    pub enabled: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The parts of a server record that decide which physical server it points at.
/// Cached library data is only valid for the identity it was fetched under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub url: String,
    pub server_type: ServerType,
    pub machine_id: String,
}

impl ServerRecord {
    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity {
            url: self.url.clone(),
            server_type: self.server_type,
            machine_id: self.machine_id.clone(),
        }
    }

    /// Usable for sync and deletion
    pub fn is_active(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }
}

/// Input for creating a server
#[derive(Debug, Clone)]
pub struct CreateServer {
    pub name: String,
    pub server_type: ServerType,
    pub url: String,
    pub api_key: String,
    pub machine_id: String,
    pub enabled: bool,
}

/// Input for updating a server
#[derive(Debug, Clone, Default)]
pub struct UpdateServer {
    pub name: Option<String>,
    pub server_type: Option<ServerType>,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub machine_id: Option<String>,
    pub enabled: Option<bool>,
}

const SERVER_COLUMNS: &str = "id, name, server_type, url, api_key, machine_id, enabled, \
                              deleted_at, created_at, updated_at";

pub struct ServerRepository {
    pool: SqlitePool,
}

impl ServerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a server by ID, including soft-deleted ones
    pub async fn get(&self, id: i64) -> Result<Option<ServerRecord>> {
        let record = sqlx::query_as::<_, ServerRecord>(&format!(
            "SELECT {} FROM media_servers WHERE id = ?",
            SERVER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// All servers that have not been deleted
    pub async fn list(&self) -> Result<Vec<ServerRecord>> {
        let records = sqlx::query_as::<_, ServerRecord>(&format!(
            "SELECT {} FROM media_servers WHERE deleted_at IS NULL ORDER BY name",
            SERVER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Servers that are enabled and not deleted
    pub async fn list_active(&self) -> Result<Vec<ServerRecord>> {
        let records = sqlx::query_as::<_, ServerRecord>(&format!(
            "SELECT {} FROM media_servers WHERE deleted_at IS NULL AND enabled = 1 ORDER BY name",
            SERVER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Create a new server
    pub async fn create(&self, input: CreateServer) -> Result<ServerRecord> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, ServerRecord>(&format!(
            r#"
            INSERT INTO media_servers (name, server_type, url, api_key, machine_id, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            SERVER_COLUMNS
        ))
        .bind(&input.name)
        .bind(input.server_type)
        .bind(&input.url)
        .bind(&input.api_key)
        .bind(&input.machine_id)
        .bind(input.enabled)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Update a server. Returns `None` when the server does not exist or is deleted.
    pub async fn update(&self, id: i64, input: UpdateServer) -> Result<Option<ServerRecord>> {
        let record = sqlx::query_as::<_, ServerRecord>(&format!(
            r#"
            UPDATE media_servers SET
                name = COALESCE(?, name),
                server_type = COALESCE(?, server_type),
                url = COALESCE(?, url),
                api_key = COALESCE(?, api_key),
                machine_id = COALESCE(?, machine_id),
                enabled = COALESCE(?, enabled),
                updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            RETURNING {}
            "#,
            SERVER_COLUMNS
        ))
        .bind(&input.name)
        .bind(input.server_type)
        .bind(&input.url)
        .bind(&input.api_key)
        .bind(&input.machine_id)
        .bind(input.enabled)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Mark a server deleted. Cached rows are kept until the next identity purge.
    pub async fn soft_delete(&self, id: i64) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE media_servers SET deleted_at = ?, enabled = 0, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
