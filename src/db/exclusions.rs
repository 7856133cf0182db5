//! Exclusion ledger repository
//!
//! An exclusion is a hard veto on candidate-hood. `rule_id = NULL` means the item
//! is excluded from every rule.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::db::library_items::MediaType;
use crate::db::sqlite_helpers::{Page, like_pattern, placeholders};

/// Exclusion joined with the cached item it vetoes
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ExclusionDetail {
    pub id: i64,
    pub rule_id: Option<i64>,
    pub library_item_id: i64,
    pub excluded_by: String,
    pub created_at: DateTime<Utc>,
    pub server_id: i64,
    pub title: String,
    pub media_type: MediaType,
    pub year: Option<i32>,
    pub file_size: i64,
}

/// One page of exclusions
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedExclusions {
    pub exclusions: Vec<ExclusionDetail>,
    pub total_count: i64,
    pub page: i64,
    pub per_page: i64,
}

pub struct ExclusionRepository {
    pool: SqlitePool,
}

impl ExclusionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Exclude items from one rule (`Some`) or from every rule (`None`).
    ///
    /// Existing exclusions are left alone. Candidate rows the new exclusions veto are
    /// removed in the same transaction. Returns the number of new exclusions.
    pub async fn create_bulk(
        &self,
        rule_id: Option<i64>,
        item_ids: &[i64],
        excluded_by: &str,
    ) -> Result<u64> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut created = 0;

        for item_id in item_ids {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO maintenance_exclusions (rule_id, library_item_id, excluded_by, created_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(rule_id)
            .bind(item_id)
            .bind(excluded_by)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            created += result.rows_affected();
        }

        let mut sql = format!(
            "DELETE FROM maintenance_candidates WHERE library_item_id IN ({})",
            placeholders(item_ids.len())
        );
        if rule_id.is_some() {
            sql.push_str(" AND rule_id = ?");
        }
        let mut query = sqlx::query(&sql);
        for item_id in item_ids {
            query = query.bind(item_id);
        }
        if let Some(rule_id) = rule_id {
            query = query.bind(rule_id);
        }
        query.execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(created)
    }

    /// Paginated exclusions of one rule (or the global list), searchable by title
    pub async fn list(
        &self,
        rule_id: Option<i64>,
        page: Page,
        search: Option<&str>,
    ) -> Result<PaginatedExclusions> {
        let search = like_pattern(search);
        let mut where_clause = String::from("e.rule_id IS ?");
        if search.is_some() {
            where_clause.push_str(" AND li.title LIKE ? ESCAPE '\\'");
        }

        let count_sql = format!(
            r#"
            SELECT COUNT(*) FROM maintenance_exclusions e
            JOIN library_items li ON li.id = e.library_item_id
            WHERE {}
            "#,
            where_clause
        );
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql).bind(rule_id);
        if let Some(ref pattern) = search {
            count = count.bind(pattern);
        }
        let total_count = count.fetch_one(&self.pool).await?;

        let data_sql = format!(
            r#"
            SELECT e.id, e.rule_id, e.library_item_id, e.excluded_by, e.created_at,
                   li.server_id, li.title, li.media_type, li.year, li.file_size
            FROM maintenance_exclusions e
            JOIN library_items li ON li.id = e.library_item_id
            WHERE {}
            ORDER BY e.created_at DESC, e.id DESC
            LIMIT ? OFFSET ?
            "#,
            where_clause
        );
        let mut data = sqlx::query_as::<_, ExclusionDetail>(&data_sql).bind(rule_id);
        if let Some(ref pattern) = search {
            data = data.bind(pattern);
        }
        let exclusions = data
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(PaginatedExclusions {
            exclusions,
            total_count,
            page: page.page,
            per_page: page.per_page,
        })
    }

    /// Remove one exclusion
    pub async fn delete(&self, rule_id: Option<i64>, item_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM maintenance_exclusions WHERE rule_id IS ? AND library_item_id = ?",
        )
        .bind(rule_id)
        .bind(item_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove several exclusions of one rule (or the global list)
    pub async fn delete_bulk(&self, rule_id: Option<i64>, item_ids: &[i64]) -> Result<u64> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM maintenance_exclusions WHERE rule_id IS ? AND library_item_id IN ({})",
            placeholders(item_ids.len())
        );
        let mut query = sqlx::query(&sql).bind(rule_id);
        for item_id in item_ids {
            query = query.bind(item_id);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    /// Items excluded from this rule, directly or globally
    pub async fn excluded_item_ids(&self, rule_id: i64) -> Result<HashSet<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT library_item_id FROM maintenance_exclusions WHERE rule_id IS NULL OR rule_id = ?",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().collect())
    }

    /// Whether the item is excluded from this rule, directly or globally
    pub async fn is_excluded(&self, rule_id: i64, item_id: i64) -> Result<bool> {
        let excluded = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM maintenance_exclusions
                WHERE library_item_id = ? AND (rule_id IS NULL OR rule_id = ?)
            )
            "#,
        )
        .bind(item_id)
        .bind(rule_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(excluded)
    }

    /// Whether any exclusion at all exists for the item
    pub async fn is_excluded_from_any_rule(&self, item_id: i64) -> Result<bool> {
        let excluded = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM maintenance_exclusions WHERE library_item_id = ?)",
        )
        .bind(item_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(excluded)
    }
}
