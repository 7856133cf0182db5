//! Test data builders shared by repository and service tests

use chrono::{Duration, Utc};
use serde_json::json;

use crate::db::library_items::MediaType;
use crate::db::rules::RuleCriterion;
use crate::db::{
    CreateRule, CreateServer, Database, LibraryItemRecord, MaintenanceRuleRecord, RuleScope,
    ServerRecord, UpsertLibraryItem,
};
use crate::db::servers::ServerType;

/// Library ID used by [library]
pub const LIBRARY: &str = "1";

pub async fn server(db: &Database, name: &str) -> ServerRecord {
    db.servers()
        .create(CreateServer {
            name: name.to_string(),
            server_type: ServerType::Plex,
            url: format!("http://{}.local:32400", name.to_lowercase()),
            api_key: "token".to_string(),
            machine_id: format!("machine-{}", name.to_lowercase()),
            enabled: true,
        })
        .await
        .unwrap()
}

/// An unwatched 1 GB movie added a year ago
pub fn movie(item_id: &str, title: &str) -> UpsertLibraryItem {
    UpsertLibraryItem {
        item_id: item_id.to_string(),
        title: title.to_string(),
        media_type: MediaType::Movie,
        year: Some(1999),
        file_size: 1 << 30,
        resolution: Some("1080".to_string()),
        tmdb_id: None,
        tvdb_id: None,
        imdb_id: None,
        season_count: 0,
        play_count: 0,
        last_watched_at: None,
        added_at: Some(Utc::now() - Duration::days(365)),
    }
}

pub fn show(item_id: &str, title: &str, seasons: i32) -> UpsertLibraryItem {
    UpsertLibraryItem {
        media_type: MediaType::Show,
        season_count: seasons,
        file_size: 10 << 30,
        ..movie(item_id, title)
    }
}

/// Plex server "Plex" with one movie per title in library [LIBRARY]. Items are
/// returned in the order of `titles`.
pub async fn library(db: &Database, titles: &[&str]) -> (ServerRecord, Vec<LibraryItemRecord>) {
    let server = server(db, "Plex").await;
    let input: Vec<UpsertLibraryItem> = titles
        .iter()
        .enumerate()
        .map(|(i, title)| movie(&format!("m{}", i), title))
        .collect();
    let items = insert(db, &server, &input).await;
    (server, items)
}

/// Write items into library [LIBRARY] of `server`, returned in input order
pub async fn insert(
    db: &Database,
    server: &ServerRecord,
    input: &[UpsertLibraryItem],
) -> Vec<LibraryItemRecord> {
    let repo = db.library_items();
    let mut existing = repo.list_for_library(server.id, LIBRARY).await.unwrap();
    let mut all: Vec<UpsertLibraryItem> = existing
        .iter()
        .filter(|e| !input.iter().any(|i| i.item_id == e.item_id))
        .map(|e| UpsertLibraryItem {
            item_id: e.item_id.clone(),
            title: e.title.clone(),
            media_type: e.media_type,
            year: e.year,
            file_size: e.file_size,
            resolution: e.resolution.clone(),
            tmdb_id: e.tmdb_id.clone(),
            tvdb_id: e.tvdb_id.clone(),
            imdb_id: e.imdb_id.clone(),
            season_count: e.season_count,
            play_count: e.play_count,
            last_watched_at: e.last_watched_at,
            added_at: e.added_at,
        })
        .collect();
    all.extend(input.iter().cloned());
    repo.replace_library(server.id, LIBRARY, &all, Utc::now()).await.unwrap();

    existing = repo.list_for_library(server.id, LIBRARY).await.unwrap();
    input
        .iter()
        .filter_map(|i| existing.iter().find(|e| e.item_id == i.item_id).cloned())
        .collect()
}

/// Enabled rule with default parameters covering the libraries of `items`
pub async fn rule(
    db: &Database,
    criterion: RuleCriterion,
    items: &[LibraryItemRecord],
) -> MaintenanceRuleRecord {
    let mut libraries: Vec<RuleScope> = Vec::new();
    for item in items {
        let scope = RuleScope { server_id: item.server_id, library_id: item.library_id.clone() };
        if !libraries.contains(&scope) {
            libraries.push(scope);
        }
    }
    db.rules()
        .create(CreateRule {
            name: format!("{} rule", criterion),
            criterion,
            parameters: json!({}),
            libraries,
            enabled: true,
        })
        .await
        .unwrap()
}
