//! Watch history repository
//!
//! Plays recorded locally (session polling, webhooks). The sync pass folds them into
//! the cache so rules see plays the remote server itself may not report.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Input for recording a play
#[derive(Debug, Clone)]
pub struct CreateWatchEvent {
    pub server_id: i64,
    pub item_id: String,
    pub user_name: String,
    pub watched_at: DateTime<Utc>,
}

/// Aggregated plays of one remote item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSummary {
    pub plays: i64,
    pub last_watched_at: DateTime<Utc>,
}

pub struct WatchHistoryRepository {
    pool: SqlitePool,
}

impl WatchHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a play
    pub async fn record(&self, input: CreateWatchEvent) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO watch_history (server_id, item_id, user_name, watched_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(input.server_id)
        .bind(&input.item_id)
        .bind(&input.user_name)
        .bind(input.watched_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Play count and latest play per remote item id for one server
    pub async fn summaries_for_server(&self, server_id: i64) -> Result<HashMap<String, WatchSummary>> {
        let rows: Vec<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT item_id, COUNT(*) AS plays, MAX(watched_at) AS last_watched_at
            FROM watch_history
            WHERE server_id = ?
            GROUP BY item_id
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(item_id, plays, last_watched_at)| {
                (item_id, WatchSummary { plays, last_watched_at })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, fixtures};

    #[tokio::test]
    async fn test_summaries_group_by_item() {
        let db = Database::in_memory().await.unwrap();
        let server = fixtures::server(&db, "Plex").await;
        let repo = db.watch_history();
        let early = Utc::now() - chrono::Duration::days(10);
        let late = Utc::now() - chrono::Duration::days(1);

        for (item, at) in [("a", early), ("a", late), ("b", early)] {
            repo.record(CreateWatchEvent {
                server_id: server.id,
                item_id: item.to_string(),
                user_name: "sam".to_string(),
                watched_at: at,
            })
            .await
            .unwrap();
        }

        let summaries = repo.summaries_for_server(server.id).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries["a"].plays, 2);
        assert_eq!(summaries["a"].last_watched_at.timestamp(), late.timestamp());
        assert_eq!(summaries["b"].plays, 1);
    }
}
