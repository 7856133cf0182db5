//! Jellyfin and Emby adapter
//!
//! Both servers speak the same REST dialect. Play state is per user, so item
//! listings are made as the first administrator account, resolved once per
//! server through the shared resolver cache. A listing without that user would
//! report every item as unwatched, so it is never made.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{
    EpisodeTotals, MediaServerAdapter, RemoteLibrary, RemoteSeason, ServerInfo,
    apply_episode_totals, error_for_status, resolution_label,
};
use crate::db::{MediaType, ServerType, UpsertLibraryItem};
use crate::services::resolver_cache::SharedResolverCache;

pub struct JellyfinAdapter {
    client: Client,
    base_url: Url,
    api_key: String,
    server_id: i64,
    flavor: ServerType,
    admin_users: SharedResolverCache<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SystemInfo {
    id: String,
    server_name: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JellyfinUser {
    id: String,
    #[serde(default)]
    policy: Option<UserPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserPolicy {
    #[serde(default)]
    is_administrator: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VirtualFolder {
    name: String,
    item_id: String,
    collection_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ItemsResponse {
    #[serde(default)]
    items: Vec<JellyfinItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JellyfinItem {
    id: String,
    name: String,
    #[serde(rename = "Type")]
    kind: String,
    production_year: Option<i32>,
    index_number: Option<i32>,
    date_created: Option<DateTime<Utc>>,
    child_count: Option<i32>,
    series_id: Option<String>,
    #[serde(default)]
    provider_ids: HashMap<String, String>,
    user_data: Option<UserData>,
    #[serde(default)]
    media_sources: Vec<MediaSource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserData {
    #[serde(default)]
    play_count: i32,
    last_played_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MediaSource {
    size: Option<i64>,
    #[serde(default)]
    media_streams: Vec<MediaStream>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MediaStream {
    #[serde(rename = "Type")]
    kind: Option<String>,
    height: Option<u32>,
}

fn provider_id(ids: &HashMap<String, String>, key: &str) -> Option<String> {
    ids.iter()
        .find(|(k, v)| k.eq_ignore_ascii_case(key) && !v.is_empty())
        .map(|(_, v)| v.clone())
}

impl JellyfinItem {
    fn file_size(&self) -> i64 {
        self.media_sources.iter().filter_map(|s| s.size).sum()
    }

    fn resolution(&self) -> Option<String> {
        self.media_sources
            .iter()
            .flat_map(|s| s.media_streams.iter())
            .find(|s| s.kind.as_deref() == Some("Video"))
            .and_then(|s| s.height)
            .map(|h| resolution_label(h).to_string())
    }

    fn into_item(self) -> Option<UpsertLibraryItem> {
        let media_type = match self.kind.as_str() {
            "Movie" => MediaType::Movie,
            "Series" => MediaType::Show,
            _ => return None,
        };
        let file_size = self.file_size();
        let resolution = self.resolution();
        let (play_count, last_watched_at) = self
            .user_data
            .map(|u| (u.play_count, u.last_played_date))
            .unwrap_or((0, None));

        Some(UpsertLibraryItem {
            tmdb_id: provider_id(&self.provider_ids, "Tmdb"),
            tvdb_id: provider_id(&self.provider_ids, "Tvdb"),
            imdb_id: provider_id(&self.provider_ids, "Imdb"),
            item_id: self.id,
            title: self.name,
            media_type,
            year: self.production_year,
            file_size,
            resolution,
            season_count: self.child_count.unwrap_or(0),
            play_count,
            last_watched_at,
            added_at: self.date_created,
        })
    }
}

const ITEM_FIELDS: &str = "ProviderIds,DateCreated,MediaSources,ChildCount";

/// Group episode media by series id
fn episode_totals(episodes: Vec<JellyfinItem>) -> HashMap<String, EpisodeTotals> {
    let mut totals: HashMap<String, EpisodeTotals> = HashMap::new();
    for episode in episodes {
        let (size, resolution) = (episode.file_size(), episode.resolution());
        if let Some(series_id) = episode.series_id {
            totals.entry(series_id).or_default().add(size, resolution);
        }
    }
    totals
}

/// Poll interval while another caller resolves the admin user
const ADMIN_WAIT_INTERVAL: Duration = Duration::from_millis(200);
/// Polls before giving up; covers the resolver cache claim window
const ADMIN_WAIT_ATTEMPTS: u32 = 50;

impl JellyfinAdapter {
    pub fn new(
        client: Client,
        server_id: i64,
        flavor: ServerType,
        base_url: &str,
        api_key: &str,
        admin_users: SharedResolverCache<String>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            base_url: super::base_url(base_url)?,
            api_key: api_key.to_string(),
            server_id,
            flavor,
            admin_users,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid {} path: {}", self.flavor, path))
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        debug!(server_type = %self.flavor, url = %url, "Media server request");
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await
            .with_context(|| format!("{} request to {} failed", self.flavor, path))?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        response
            .json()
            .await
            .with_context(|| format!("Invalid {} response from {}", self.flavor, path))
    }

    /// Id of the first administrator, used for per-user play state
    async fn admin_user_id(&self) -> Result<Option<String>> {
        self.admin_users
            .get_or_fetch(&self.server_id.to_string(), || async {
                let users: Vec<JellyfinUser> = self.get("/Users").await?;
                users
                    .into_iter()
                    .find(|u| u.policy.as_ref().is_some_and(|p| p.is_administrator))
                    .map(|u| u.id)
                    .context("No administrator account found")
            })
            .await
    }

    /// Like [Self::admin_user_id], but waits out a lookup claimed by another caller.
    /// Lookup failures are returned so the listing fails instead of losing play state.
    async fn require_admin_user_id(&self) -> Result<String> {
        for _ in 0..ADMIN_WAIT_ATTEMPTS {
            if let Some(user_id) = self.admin_user_id().await? {
                return Ok(user_id);
            }
            tokio::time::sleep(ADMIN_WAIT_INTERVAL).await;
        }
        anyhow::bail!(
            "administrator lookup for {} server {} did not finish",
            self.flavor,
            self.server_id
        )
    }
}

#[async_trait]
impl MediaServerAdapter for JellyfinAdapter {
    async fn test_connection(&self) -> Result<ServerInfo> {
        let info: SystemInfo = self.get("/System/Info").await?;
        Ok(ServerInfo {
            machine_id: info.id,
            name: info.server_name.unwrap_or_else(|| self.flavor.to_string()),
            version: info.version,
        })
    }

    async fn get_libraries(&self) -> Result<Vec<RemoteLibrary>> {
        let folders: Vec<VirtualFolder> = self.get("/Library/VirtualFolders").await?;
        Ok(folders
            .into_iter()
            .map(|f| RemoteLibrary {
                media_type: match f.collection_type.as_deref() {
                    Some("movies") => Some(MediaType::Movie),
                    Some("tvshows") => Some(MediaType::Show),
                    _ => None,
                },
                id: f.item_id,
                title: f.name,
            })
            .collect())
    }

    async fn get_library_items(&self, library_id: &str) -> Result<Vec<UpsertLibraryItem>> {
        let query = format!(
            "ParentId={}&Recursive=true&IncludeItemTypes=Movie,Series&Fields={}",
            library_id, ITEM_FIELDS
        );
        let user_id = self
            .require_admin_user_id()
            .await
            .context("Cannot list items without an administrator for play state")?;

        let response: ItemsResponse = self
            .get(&format!("/Users/{}/Items?{}", user_id, query))
            .await?;
        let mut items: Vec<UpsertLibraryItem> = response
            .items
            .into_iter()
            .filter_map(JellyfinItem::into_item)
            .collect();

        // Series carry no media sources; sizes come from their episodes
        if items.iter().any(|i| i.media_type == MediaType::Show) {
            let episodes: ItemsResponse = self
                .get(&format!(
                    "/Users/{}/Items?ParentId={}&Recursive=true&IncludeItemTypes=Episode&Fields=MediaSources",
                    user_id, library_id
                ))
                .await?;
            apply_episode_totals(&mut items, &episode_totals(episodes.items));
        }
        Ok(items)
    }

    async fn get_seasons(&self, show_id: &str) -> Result<Vec<RemoteSeason>> {
        let response: ItemsResponse = self
            .get(&format!("/Shows/{}/Seasons?Fields=DateCreated", show_id))
            .await?;
        Ok(response
            .items
            .into_iter()
            .map(|s| RemoteSeason {
                id: s.id,
                index: s.index_number.unwrap_or(0),
                title: s.name,
                added_at: s.date_created,
            })
            .collect())
    }

    async fn delete_item(&self, item_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("/Items/{}", item_id))?;
        let response = self
            .client
            .delete(url)
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await
            .with_context(|| format!("{} delete request failed", self.flavor))?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::resolver_cache::ResolverCache;
    use axum::{Json, Router, extract::Query, routing::get};
    use serde_json::{Value as JsonValue, json};
    use std::sync::Arc;
    use tokio::sync::{Notify, oneshot};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    async fn user_items(Query(query): Query<HashMap<String, String>>) -> Json<JsonValue> {
        if query.get("IncludeItemTypes").map(String::as_str) == Some("Episode") {
            return Json(json!({ "Items": [
                { "Id": "e1", "Name": "Pilot", "Type": "Episode", "SeriesId": "abc",
                  "MediaSources": [{ "Size": 300, "MediaStreams": [{ "Type": "Video", "Height": 720 }] }] },
                { "Id": "e2", "Name": "Finale", "Type": "Episode", "SeriesId": "abc",
                  "MediaSources": [{ "Size": 200, "MediaStreams": [{ "Type": "Video", "Height": 1080 }] }] }
            ]}));
        }
        Json(json!({ "Items": [
            { "Id": "abc", "Name": "The Expanse", "Type": "Series", "ChildCount": 2,
              "UserData": { "PlayCount": 3, "LastPlayedDate": "2023-05-01T20:00:00Z" } },
            { "Id": "def", "Name": "Alien", "Type": "Movie",
              "UserData": { "PlayCount": 1 },
              "MediaSources": [{ "Size": 2048 }] }
        ]}))
    }

    fn adapter(url: &str, cache: SharedResolverCache<String>) -> JellyfinAdapter {
        JellyfinAdapter::new(Client::new(), 7, ServerType::Jellyfin, url, "key", cache).unwrap()
    }

    #[tokio::test]
    async fn test_listing_waits_for_admin_lookup_claimed_elsewhere() {
        let app = Router::new()
            .route(
                "/Users",
                get(|| async { Json(json!([{ "Id": "admin1", "Policy": { "IsAdministrator": true } }])) }),
            )
            .route("/Users/{user_id}/Items", get(user_items));
        let url = serve(app).await;
        let cache: SharedResolverCache<String> =
            Arc::new(ResolverCache::new("admin_users", Duration::from_secs(60)));

        // another sync of the same server holds the lookup claim
        let gate = Arc::new(Notify::new());
        let (claimed_tx, claimed_rx) = oneshot::channel();
        let holder = {
            let cache = cache.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("7", || async move {
                        let _ = claimed_tx.send(());
                        gate.notified().await;
                        Ok("admin1".to_string())
                    })
                    .await
            })
        };
        claimed_rx.await.unwrap();

        let listing = {
            let jellyfin = adapter(&url, cache.clone());
            tokio::spawn(async move { jellyfin.get_library_items("lib").await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        gate.notify_one();
        holder.await.unwrap().unwrap();

        let items = listing.await.unwrap().unwrap();
        assert_eq!(items.len(), 2);
        let show = items.iter().find(|i| i.item_id == "abc").unwrap();
        assert_eq!(show.play_count, 3);
        assert!(show.last_watched_at.is_some());
        assert_eq!(show.file_size, 500);
        assert_eq!(show.resolution.as_deref(), Some("1080"));
        let movie = items.iter().find(|i| i.item_id == "def").unwrap();
        assert_eq!(movie.play_count, 1);
        assert_eq!(movie.file_size, 2048);
    }

    #[tokio::test]
    async fn test_listing_fails_without_admin_user() {
        let app = Router::new()
            .route(
                "/Users",
                get(|| async { Json(json!([{ "Id": "viewer", "Policy": { "IsAdministrator": false } }])) }),
            )
            .route("/Users/{user_id}/Items", get(user_items))
            .route("/Items", get(user_items));
        let url = serve(app).await;
        let cache: SharedResolverCache<String> =
            Arc::new(ResolverCache::new("admin_users", Duration::from_secs(60)));

        let result = adapter(&url, cache).get_library_items("lib").await;

        assert!(result.is_err());
    }

    #[test]
    fn test_series_maps_with_provider_ids_and_play_state() {
        let json = r#"{
            "Items": [
                {
                    "Id": "abc",
                    "Name": "The Expanse",
                    "Type": "Series",
                    "ProductionYear": 2015,
                    "DateCreated": "2021-03-01T10:00:00Z",
                    "ChildCount": 6,
                    "ProviderIds": {"Tvdb": "280619", "Imdb": "tt3230854"},
                    "UserData": {"PlayCount": 3, "LastPlayedDate": "2023-05-01T20:00:00Z"}
                },
                {
                    "Id": "def",
                    "Name": "Alien",
                    "Type": "Movie",
                    "MediaSources": [{"Size": 2048, "MediaStreams": [{"Type": "Audio"}, {"Type": "Video", "Height": 2160}]}]
                },
                {"Id": "ghi", "Name": "Folder", "Type": "Folder"}
            ]
        }"#;
        let response: ItemsResponse = serde_json::from_str(json).unwrap();
        let items: Vec<_> = response.items.into_iter().filter_map(JellyfinItem::into_item).collect();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].media_type, MediaType::Show);
        assert_eq!(items[0].season_count, 6);
        assert_eq!(items[0].tvdb_id.as_deref(), Some("280619"));
        assert_eq!(items[0].play_count, 3);
        assert!(items[0].last_watched_at.is_some());
        assert_eq!(items[1].resolution.as_deref(), Some("4k"));
        assert_eq!(items[1].file_size, 2048);
    }
}
