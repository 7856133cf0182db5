//! Deletion audit log
//!
//! Append-only. Every deletion attempt writes one row, whatever its outcome.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::db::library_items::MediaType;
use crate::db::sqlite_helpers::Page;

/// Audit row
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeleteAuditRecord {
    pub id: i64,
    pub server_id: i64,
    pub item_id: String,
    pub title: String,
    pub media_type: MediaType,
    pub file_size: i64,
    pub deleted_by: String,
    pub server_deleted: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for one audit row
#[derive(Debug, Clone)]
pub struct CreateAuditRecord {
    pub server_id: i64,
    pub item_id: String,
    pub title: String,
    pub media_type: MediaType,
    pub file_size: i64,
    pub deleted_by: String,
    pub server_deleted: bool,
    pub error_message: Option<String>,
}

/// One page of the audit log, newest first
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedAudit {
    pub records: Vec<DeleteAuditRecord>,
    pub total_count: i64,
    pub page: i64,
    pub per_page: i64,
}

pub struct AuditRepository {
    pool: SqlitePool,
}

impl AuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an audit row
    pub async fn record(&self, input: CreateAuditRecord) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO delete_audit_log (
                server_id, item_id, title, media_type, file_size, deleted_by,
                server_deleted, error_message, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(input.server_id)
        .bind(&input.item_id)
        .bind(&input.title)
        .bind(input.media_type)
        .bind(input.file_size)
        .bind(&input.deleted_by)
        .bind(input.server_deleted)
        .bind(&input.error_message)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Paginated log, newest first
    pub async fn list(&self, page: Page) -> Result<PaginatedAudit> {
        let total_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM delete_audit_log")
            .fetch_one(&self.pool)
            .await?;

        let records = sqlx::query_as::<_, DeleteAuditRecord>(
            r#"
            SELECT id, server_id, item_id, title, media_type, file_size, deleted_by,
                   server_deleted, error_message, created_at
            FROM delete_audit_log
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(PaginatedAudit {
            records,
            total_count,
            page: page.page,
            per_page: page.per_page,
        })
    }
}
