//! Idempotent schema creation
//!
//! Every statement is `IF NOT EXISTS`, so applying the schema on each start is
//! safe. Column changes require a manual migration.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

const TABLES: &[(&str, &str)] = &[
    (
        "media_servers",
        r#"
        CREATE TABLE IF NOT EXISTS media_servers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            server_type TEXT NOT NULL,
            url TEXT NOT NULL,
            api_key TEXT NOT NULL,
            machine_id TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            deleted_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "library_items",
        r#"
        CREATE TABLE IF NOT EXISTS library_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id INTEGER NOT NULL REFERENCES media_servers(id) ON DELETE CASCADE,
            library_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            title TEXT NOT NULL,
            media_type TEXT NOT NULL,
            year INTEGER,
            file_size INTEGER NOT NULL DEFAULT 0,
            resolution TEXT,
            tmdb_id TEXT,
            tvdb_id TEXT,
            imdb_id TEXT,
            season_count INTEGER NOT NULL DEFAULT 0,
            play_count INTEGER NOT NULL DEFAULT 0,
            last_watched_at TEXT,
            added_at TEXT,
            synced_at TEXT NOT NULL,
            UNIQUE (server_id, library_id, item_id)
        )
        "#,
    ),
    (
        "watch_history",
        r#"
        CREATE TABLE IF NOT EXISTS watch_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id INTEGER NOT NULL REFERENCES media_servers(id) ON DELETE CASCADE,
            item_id TEXT NOT NULL,
            user_name TEXT NOT NULL,
            watched_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "maintenance_rules",
        r#"
        CREATE TABLE IF NOT EXISTS maintenance_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            criterion TEXT NOT NULL,
            parameters TEXT NOT NULL DEFAULT '{}',
            libraries TEXT NOT NULL DEFAULT '[]',
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "maintenance_candidates",
        r#"
        CREATE TABLE IF NOT EXISTS maintenance_candidates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_id INTEGER NOT NULL REFERENCES maintenance_rules(id) ON DELETE CASCADE,
            library_item_id INTEGER NOT NULL REFERENCES library_items(id) ON DELETE CASCADE,
            reason TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            UNIQUE (rule_id, library_item_id)
        )
        "#,
    ),
    (
        "maintenance_exclusions",
        r#"
        CREATE TABLE IF NOT EXISTS maintenance_exclusions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_id INTEGER REFERENCES maintenance_rules(id) ON DELETE CASCADE,
            library_item_id INTEGER NOT NULL REFERENCES library_items(id) ON DELETE CASCADE,
            excluded_by TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "delete_audit_log",
        r#"
        CREATE TABLE IF NOT EXISTS delete_audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id INTEGER NOT NULL,
            item_id TEXT NOT NULL,
            title TEXT NOT NULL,
            media_type TEXT NOT NULL,
            file_size INTEGER NOT NULL DEFAULT 0,
            deleted_by TEXT NOT NULL,
            server_deleted INTEGER NOT NULL,
            error_message TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    ),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_library_items_library ON library_items(server_id, library_id)",
    "CREATE INDEX IF NOT EXISTS idx_library_items_tmdb ON library_items(tmdb_id)",
    "CREATE INDEX IF NOT EXISTS idx_library_items_tvdb ON library_items(tvdb_id)",
    "CREATE INDEX IF NOT EXISTS idx_watch_history_item ON watch_history(server_id, item_id)",
    "CREATE INDEX IF NOT EXISTS idx_candidates_item ON maintenance_candidates(library_item_id)",
    // NULL rule_id means "every rule"; COALESCE makes it participate in uniqueness.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_exclusions_unique ON maintenance_exclusions(COALESCE(rule_id, 0), library_item_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_created ON delete_audit_log(created_at)",
];

/// Create all tables and indexes
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for (name, sql) in TABLES {
        sqlx::query(sql)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create table {}", name))?;
        debug!(table = %name, "Table ensured");
    }
    for sql in INDEXES {
        sqlx::query(sql)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create index: {}", sql))?;
    }
    Ok(())
}
