//! Library cache repository
//!
//! Mirrors the items of each remote library. Rows are keyed by
//! (server, library, remote item id); the local `id` stays stable across syncs
//! because upserts update in place, which keeps candidates and exclusions attached.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::db::sqlite_helpers::placeholders;

/// Kind of library item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Show,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Movie => write!(f, "movie"),
            MediaType::Show => write!(f, "show"),
        }
    }
}

/// Cached library item
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LibraryItemRecord {
    pub id: i64,
    pub server_id: i64,
    pub library_id: String,
    pub item_id: String,
    pub title: String,
    pub media_type: MediaType,
    pub year: Option<i32>,
    pub file_size: i64,
    pub resolution: Option<String>,
    pub tmdb_id: Option<String>,
    pub tvdb_id: Option<String>,
    pub imdb_id: Option<String>,
    pub season_count: i32,
    pub play_count: i32,
    pub last_watched_at: Option<DateTime<Utc>>,
    pub added_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

/// Input row for a sync pass
#[derive(Debug, Clone)]
pub struct UpsertLibraryItem {
    pub item_id: String,
    pub title: String,
    pub media_type: MediaType,
    pub year: Option<i32>,
    pub file_size: i64,
    pub resolution: Option<String>,
    pub tmdb_id: Option<String>,
    pub tvdb_id: Option<String>,
    pub imdb_id: Option<String>,
    pub season_count: i32,
    pub play_count: i32,
    pub last_watched_at: Option<DateTime<Utc>>,
    pub added_at: Option<DateTime<Utc>>,
}

/// Counts from one upsert + sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncWriteResult {
    pub upserted: u64,
    pub deleted: u64,
}

const ITEM_COLUMNS: &str = "id, server_id, library_id, item_id, title, media_type, year, file_size, \
                            resolution, tmdb_id, tvdb_id, imdb_id, season_count, play_count, \
                            last_watched_at, added_at, synced_at";

pub struct LibraryItemRepository {
    pool: SqlitePool,
}

impl LibraryItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a cached item by local ID
    pub async fn get(&self, id: i64) -> Result<Option<LibraryItemRecord>> {
        let record = sqlx::query_as::<_, LibraryItemRecord>(&format!(
            "SELECT {} FROM library_items WHERE id = ?",
            ITEM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// IDs from `ids` that exist in the cache
    pub async fn existing_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id FROM library_items WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// All cached items of one library
    pub async fn list_for_library(
        &self,
        server_id: i64,
        library_id: &str,
    ) -> Result<Vec<LibraryItemRecord>> {
        let records = sqlx::query_as::<_, LibraryItemRecord>(&format!(
            "SELECT {} FROM library_items WHERE server_id = ? AND library_id = ? ORDER BY title",
            ITEM_COLUMNS
        ))
        .bind(server_id)
        .bind(library_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Upsert every fetched item and delete rows of the same library that were not
    /// part of this pass. Runs in one transaction: either both happen or neither.
    pub async fn replace_library(
        &self,
        server_id: i64,
        library_id: &str,
        items: &[UpsertLibraryItem],
        synced_at: DateTime<Utc>,
    ) -> Result<SyncWriteResult> {
        let mut tx = self.pool.begin().await?;
        let mut result = SyncWriteResult::default();

        for item in items {
            let done = sqlx::query(
                r#"
                INSERT INTO library_items (
                    server_id, library_id, item_id, title, media_type, year, file_size,
                    resolution, tmdb_id, tvdb_id, imdb_id, season_count, play_count,
                    last_watched_at, added_at, synced_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (server_id, library_id, item_id) DO UPDATE SET
                    title = excluded.title,
                    media_type = excluded.media_type,
                    year = excluded.year,
                    file_size = excluded.file_size,
                    resolution = excluded.resolution,
                    tmdb_id = excluded.tmdb_id,
                    tvdb_id = excluded.tvdb_id,
                    imdb_id = excluded.imdb_id,
                    season_count = excluded.season_count,
                    play_count = excluded.play_count,
                    last_watched_at = excluded.last_watched_at,
                    added_at = excluded.added_at,
                    synced_at = excluded.synced_at
                "#,
            )
            .bind(server_id)
            .bind(library_id)
            .bind(&item.item_id)
            .bind(&item.title)
            .bind(item.media_type)
            .bind(item.year)
            .bind(item.file_size)
            .bind(&item.resolution)
            .bind(&item.tmdb_id)
            .bind(&item.tvdb_id)
            .bind(&item.imdb_id)
            .bind(item.season_count)
            .bind(item.play_count)
            .bind(item.last_watched_at)
            .bind(item.added_at)
            .bind(synced_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to upsert item {}", item.item_id))?;
            result.upserted += done.rows_affected();
        }

        let swept = sqlx::query(
            "DELETE FROM library_items WHERE server_id = ? AND library_id = ? AND synced_at <> ?",
        )
        .bind(server_id)
        .bind(library_id)
        .bind(synced_at)
        .execute(&mut *tx)
        .await
        .context("Failed to sweep stale library items")?;
        result.deleted = swept.rows_affected();

        tx.commit().await?;
        Ok(result)
    }

    /// Remove one cached item (after a confirmed remote deletion)
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM library_items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop every cached row of a server. Candidates and exclusions go with them.
    pub async fn delete_for_server(&self, server_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM library_items WHERE server_id = ?")
            .bind(server_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Lower the cached season count after seasons were removed remotely
    pub async fn decrement_seasons(&self, id: i64, by: i32) -> Result<()> {
        sqlx::query("UPDATE library_items SET season_count = MAX(season_count - ?, 0) WHERE id = ?")
            .bind(by)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Copies of the same catalog entry on other active servers
    pub async fn find_cross_server_copies(
        &self,
        item: &LibraryItemRecord,
    ) -> Result<Vec<LibraryItemRecord>> {
        if item.tmdb_id.is_none() && item.tvdb_id.is_none() && item.imdb_id.is_none() {
            return Ok(Vec::new());
        }

        let records = sqlx::query_as::<_, LibraryItemRecord>(&format!(
            r#"
            SELECT {} FROM library_items li
            WHERE li.server_id <> ?
              AND li.media_type = ?
              AND ((? IS NOT NULL AND li.tmdb_id = ?)
                OR (? IS NOT NULL AND li.tvdb_id = ?)
                OR (? IS NOT NULL AND li.imdb_id = ?))
              AND EXISTS (
                  SELECT 1 FROM media_servers s
                  WHERE s.id = li.server_id AND s.deleted_at IS NULL AND s.enabled = 1
              )
            ORDER BY li.server_id, li.id
            "#,
            ITEM_COLUMNS
        ))
        .bind(item.server_id)
        .bind(item.media_type)
        .bind(&item.tmdb_id)
        .bind(&item.tmdb_id)
        .bind(&item.tvdb_id)
        .bind(&item.tvdb_id)
        .bind(&item.imdb_id)
        .bind(&item.imdb_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::db::fixtures;

    #[tokio::test]
    async fn test_replace_library_sweeps_only_that_library() {
        let db = Database::in_memory().await.unwrap();
        let server = fixtures::server(&db, "Plex").await;
        let repo = db.library_items();

        let first = Utc::now();
        repo.replace_library(
            server.id,
            "1",
            &[fixtures::movie("a", "Alien"), fixtures::movie("b", "Brazil")],
            first,
        )
        .await
        .unwrap();
        repo.replace_library(server.id, "2", &[fixtures::movie("c", "Casablanca")], first)
            .await
            .unwrap();

        let a_id = repo.list_for_library(server.id, "1").await.unwrap()[0].id;

        let second = first + chrono::Duration::seconds(5);
        let written = repo
            .replace_library(server.id, "1", &[fixtures::movie("a", "Alien (Director's Cut)")], second)
            .await
            .unwrap();
        assert_eq!(written.deleted, 1);

        let lib1 = repo.list_for_library(server.id, "1").await.unwrap();
        assert_eq!(lib1.len(), 1);
        assert_eq!(lib1[0].id, a_id, "upsert keeps the local id");
        assert_eq!(lib1[0].title, "Alien (Director's Cut)");
        assert_eq!(lib1[0].synced_at.timestamp(), second.timestamp());

        assert_eq!(repo.list_for_library(server.id, "2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cross_server_copies_match_on_catalog_id() {
        let db = Database::in_memory().await.unwrap();
        let plex = fixtures::server(&db, "Plex").await;
        let jelly = fixtures::server(&db, "Jellyfin").await;
        let repo = db.library_items();

        let mut alien = fixtures::movie("a", "Alien");
        alien.tmdb_id = Some("348".into());
        repo.replace_library(plex.id, "1", &[alien.clone()], Utc::now()).await.unwrap();

        let mut copy = fixtures::movie("x9", "Alien");
        copy.tmdb_id = Some("348".into());
        let mut other = fixtures::movie("x10", "Aliens");
        other.tmdb_id = Some("679".into());
        repo.replace_library(jelly.id, "movies", &[copy, other], Utc::now()).await.unwrap();

        let primary = &repo.list_for_library(plex.id, "1").await.unwrap()[0];
        let copies = repo.find_cross_server_copies(primary).await.unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].item_id, "x9");
        assert_eq!(copies[0].tmdb_id, primary.tmdb_id);
        assert_ne!(copies[0].server_id, primary.server_id);
    }
}
