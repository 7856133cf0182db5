//! Maintenance candidate repository
//!
//! Candidates are the materialized output of rule evaluation. Each evaluation
//! replaces a rule's set wholesale, so the table always converges to what the
//! rule currently matches.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::db::library_items::MediaType;
use crate::db::sqlite_helpers::{Page, like_pattern};

/// Candidate row
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CandidateRecord {
    pub id: i64,
    pub rule_id: i64,
    pub library_item_id: i64,
    pub reason: String,
    pub computed_at: DateTime<Utc>,
}

/// Candidate joined with its cached item and server, as listed to operators
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CandidateDetail {
    pub id: i64,
    pub rule_id: i64,
    pub library_item_id: i64,
    pub reason: String,
    pub computed_at: DateTime<Utc>,
    pub server_id: i64,
    pub server_name: String,
    pub library_id: String,
    pub item_id: String,
    pub title: String,
    pub media_type: MediaType,
    pub year: Option<i32>,
    pub file_size: i64,
    pub resolution: Option<String>,
    pub play_count: i32,
    pub last_watched_at: Option<DateTime<Utc>>,
    pub added_at: Option<DateTime<Utc>>,
}

/// Input for one matched item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertCandidate {
    pub library_item_id: i64,
    pub reason: String,
}

/// Sortable candidate columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidateSort {
    Title,
    Year,
    FileSize,
    AddedAt,
    LastWatchedAt,
    #[default]
    ComputedAt,
}

impl CandidateSort {
    /// Parse a `sort_by` query value; unknown values fall back to the default
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.to_lowercase()).as_deref() {
            Some("title") => CandidateSort::Title,
            Some("year") => CandidateSort::Year,
            Some("file_size") | Some("size") => CandidateSort::FileSize,
            Some("added_at") | Some("added") => CandidateSort::AddedAt,
            Some("last_watched_at") | Some("last_watched") => CandidateSort::LastWatchedAt,
            _ => CandidateSort::ComputedAt,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            CandidateSort::Title => "li.title COLLATE NOCASE",
            CandidateSort::Year => "li.year",
            CandidateSort::FileSize => "li.file_size",
            CandidateSort::AddedAt => "li.added_at",
            CandidateSort::LastWatchedAt => "li.last_watched_at",
            CandidateSort::ComputedAt => "c.computed_at",
        }
    }
}

/// Listing options for a rule's candidates
#[derive(Debug, Clone, Default)]
pub struct CandidateListQuery {
    pub page: Page,
    pub search: Option<String>,
    pub sort: CandidateSort,
    pub descending: bool,
}

/// One page of candidates
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedCandidates {
    pub candidates: Vec<CandidateDetail>,
    pub total_count: i64,
    pub total_size: i64,
    pub page: i64,
    pub per_page: i64,
}

// Excluded items are filtered at read time as well, so a candidate row that
// predates an exclusion is never shown.
const NOT_EXCLUDED: &str = r#"
    NOT EXISTS (
        SELECT 1 FROM maintenance_exclusions e
        WHERE e.library_item_id = c.library_item_id
          AND (e.rule_id IS NULL OR e.rule_id = c.rule_id)
    )
"#;

pub struct CandidateRepository {
    pool: SqlitePool,
}

impl CandidateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a candidate by ID
    pub async fn get(&self, id: i64) -> Result<Option<CandidateRecord>> {
        let record = sqlx::query_as::<_, CandidateRecord>(
            "SELECT id, rule_id, library_item_id, reason, computed_at FROM maintenance_candidates WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Every candidate row of a rule, excluded or not, ordered by item
    pub async fn list_rows_for_rule(&self, rule_id: i64) -> Result<Vec<CandidateRecord>> {
        let records = sqlx::query_as::<_, CandidateRecord>(
            r#"
            SELECT id, rule_id, library_item_id, reason, computed_at
            FROM maintenance_candidates
            WHERE rule_id = ?
            ORDER BY library_item_id
            "#,
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Paginated, searchable, sortable candidates of a rule with excluded items removed
    pub async fn list_for_rule(
        &self,
        rule_id: i64,
        query: &CandidateListQuery,
    ) -> Result<PaginatedCandidates> {
        let search = like_pattern(query.search.as_deref());
        let mut where_clause = format!("c.rule_id = ? AND {}", NOT_EXCLUDED);
        if search.is_some() {
            where_clause.push_str(" AND li.title LIKE ? ESCAPE '\\'");
        }

        let totals_sql = format!(
            r#"
            SELECT COUNT(*), COALESCE(SUM(li.file_size), 0)
            FROM maintenance_candidates c
            JOIN library_items li ON li.id = c.library_item_id
            WHERE {}
            "#,
            where_clause
        );
        let mut totals = sqlx::query_as::<_, (i64, i64)>(&totals_sql).bind(rule_id);
        if let Some(ref pattern) = search {
            totals = totals.bind(pattern);
        }
        let (total_count, total_size) = totals.fetch_one(&self.pool).await?;

        let data_sql = format!(
            r#"
            SELECT c.id, c.rule_id, c.library_item_id, c.reason, c.computed_at,
                   li.server_id, s.name AS server_name, li.library_id, li.item_id, li.title,
                   li.media_type, li.year, li.file_size, li.resolution, li.play_count,
                   li.last_watched_at, li.added_at
            FROM maintenance_candidates c
            JOIN library_items li ON li.id = c.library_item_id
            JOIN media_servers s ON s.id = li.server_id
            WHERE {}
            ORDER BY {} {}, c.id
            LIMIT ? OFFSET ?
            "#,
            where_clause,
            query.sort.column(),
            if query.descending { "DESC" } else { "ASC" }
        );
        let mut data = sqlx::query_as::<_, CandidateDetail>(&data_sql).bind(rule_id);
        if let Some(ref pattern) = search {
            data = data.bind(pattern);
        }
        let candidates = data
            .bind(query.page.limit())
            .bind(query.page.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(PaginatedCandidates {
            candidates,
            total_count,
            total_size,
            page: query.page.page,
            per_page: query.page.per_page,
        })
    }

    /// Converge a rule's candidates to exactly `matches`. Rows that still match keep
    /// their IDs; rows that no longer match are removed.
    pub async fn replace_for_rule(
        &self,
        rule_id: i64,
        matches: &[UpsertCandidate],
        computed_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        for m in matches {
            sqlx::query(
                r#"
                INSERT INTO maintenance_candidates (rule_id, library_item_id, reason, computed_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (rule_id, library_item_id) DO UPDATE SET
                    reason = excluded.reason,
                    computed_at = excluded.computed_at
                "#,
            )
            .bind(rule_id)
            .bind(m.library_item_id)
            .bind(&m.reason)
            .bind(computed_at)
            .execute(&mut *tx)
            .await?;
        }

        let removed = sqlx::query(
            "DELETE FROM maintenance_candidates WHERE rule_id = ? AND computed_at <> ?",
        )
        .bind(rule_id)
        .bind(computed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(removed.rows_affected())
    }

    /// Delete one candidate row
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM maintenance_candidates WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
