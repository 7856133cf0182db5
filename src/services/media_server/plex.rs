//! Plex Media Server adapter

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{
    EpisodeTotals, MediaServerAdapter, RemoteLibrary, RemoteSeason, ServerInfo,
    apply_episode_totals, error_for_status,
};
use crate::db::{MediaType, UpsertLibraryItem};

pub struct PlexAdapter {
    client: Client,
    base_url: Url,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "MediaContainer")]
    media_container: T,
}

#[derive(Debug, Deserialize)]
struct IdentityContainer {
    #[serde(rename = "machineIdentifier")]
    machine_identifier: String,
    version: Option<String>,
    #[serde(rename = "friendlyName")]
    friendly_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectoryContainer {
    #[serde(rename = "Directory", default)]
    directory: Vec<PlexDirectory>,
}

#[derive(Debug, Deserialize)]
struct PlexDirectory {
    key: String,
    title: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct MetadataContainer {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<PlexMetadata>,
}

#[derive(Debug, Deserialize)]
struct PlexMetadata {
    #[serde(rename = "ratingKey")]
    rating_key: String,
    title: String,
    #[serde(rename = "type")]
    kind: String,
    year: Option<i32>,
    index: Option<i32>,
    #[serde(rename = "addedAt")]
    added_at: Option<i64>,
    #[serde(rename = "lastViewedAt")]
    last_viewed_at: Option<i64>,
    #[serde(rename = "viewCount")]
    view_count: Option<i32>,
    #[serde(rename = "childCount")]
    child_count: Option<i32>,
    /// Show of an episode
    #[serde(rename = "grandparentRatingKey")]
    grandparent_rating_key: Option<String>,
    #[serde(rename = "Guid", default)]
    guids: Vec<PlexGuid>,
    #[serde(rename = "Media", default)]
    media: Vec<PlexMedia>,
}

#[derive(Debug, Deserialize)]
struct PlexGuid {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PlexMedia {
    #[serde(rename = "videoResolution")]
    video_resolution: Option<String>,
    #[serde(rename = "Part", default)]
    parts: Vec<PlexPart>,
}

#[derive(Debug, Deserialize)]
struct PlexPart {
    size: Option<i64>,
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
}

/// Pull `tmdb://`, `tvdb://` and `imdb://` ids out of Plex guids
fn external_ids(guids: &[PlexGuid]) -> (Option<String>, Option<String>, Option<String>) {
    let mut tmdb = None;
    let mut tvdb = None;
    let mut imdb = None;
    for guid in guids {
        if let Some((scheme, id)) = guid.id.split_once("://") {
            let slot = match scheme {
                "tmdb" => &mut tmdb,
                "tvdb" => &mut tvdb,
                "imdb" => &mut imdb,
                _ => continue,
            };
            if slot.is_none() && !id.is_empty() {
                *slot = Some(id.to_string());
            }
        }
    }
    (tmdb, tvdb, imdb)
}

impl PlexMetadata {
    fn file_size(&self) -> i64 {
        self.media
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| p.size)
            .sum()
    }

    fn resolution(&self) -> Option<String> {
        self.media
            .iter()
            .find_map(|m| m.video_resolution.clone())
            .map(|r| r.to_lowercase())
    }

    fn into_item(self) -> Option<UpsertLibraryItem> {
        let media_type = match self.kind.as_str() {
            "movie" => MediaType::Movie,
            "show" => MediaType::Show,
            _ => return None,
        };
        let (tmdb_id, tvdb_id, imdb_id) = external_ids(&self.guids);
        let file_size = self.file_size();
        let resolution = self.resolution();

        Some(UpsertLibraryItem {
            item_id: self.rating_key,
            title: self.title,
            media_type,
            year: self.year,
            file_size,
            resolution,
            tmdb_id,
            tvdb_id,
            imdb_id,
            season_count: self.child_count.unwrap_or(0),
            play_count: self.view_count.unwrap_or(0),
            last_watched_at: timestamp(self.last_viewed_at),
            added_at: timestamp(self.added_at),
        })
    }
}

/// Group episode media by show rating key
fn episode_totals(episodes: Vec<PlexMetadata>) -> HashMap<String, EpisodeTotals> {
    let mut totals: HashMap<String, EpisodeTotals> = HashMap::new();
    for episode in episodes.iter().filter(|m| m.kind == "episode") {
        if let Some(show) = &episode.grandparent_rating_key {
            totals
                .entry(show.clone())
                .or_default()
                .add(episode.file_size(), episode.resolution());
        }
    }
    totals
}

impl PlexAdapter {
    pub fn new(client: Client, base_url: &str, token: &str) -> Result<Self> {
        let base_url = super::base_url(base_url)?;
        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid Plex path: {}", path))
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        debug!(url = %url, "Plex request");
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .header("X-Plex-Token", &self.token)
            .send()
            .await
            .with_context(|| format!("Plex request to {} failed", path))?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .with_context(|| format!("Invalid Plex response from {}", path))?;
        Ok(envelope.media_container)
    }
}

#[async_trait]
impl MediaServerAdapter for PlexAdapter {
    async fn test_connection(&self) -> Result<ServerInfo> {
        let identity: IdentityContainer = self.get("/identity").await?;
        Ok(ServerInfo {
            name: identity.friendly_name.unwrap_or_else(|| "Plex".to_string()),
            machine_id: identity.machine_identifier,
            version: identity.version,
        })
    }

    async fn get_libraries(&self) -> Result<Vec<RemoteLibrary>> {
        let container: DirectoryContainer = self.get("/library/sections").await?;
        Ok(container
            .directory
            .into_iter()
            .map(|d| RemoteLibrary {
                media_type: match d.kind.as_str() {
                    "movie" => Some(MediaType::Movie),
                    "show" => Some(MediaType::Show),
                    _ => None,
                },
                id: d.key,
                title: d.title,
            })
            .collect())
    }

    async fn get_library_items(&self, library_id: &str) -> Result<Vec<UpsertLibraryItem>> {
        let container: MetadataContainer = self
            .get(&format!("/library/sections/{}/all?includeGuids=1", library_id))
            .await?;
        let mut items: Vec<UpsertLibraryItem> = container
            .metadata
            .into_iter()
            .filter_map(PlexMetadata::into_item)
            .collect();

        // Shows carry no media of their own; type=4 lists the section's episodes
        if items.iter().any(|i| i.media_type == MediaType::Show) {
            let episodes: MetadataContainer = self
                .get(&format!("/library/sections/{}/all?type=4", library_id))
                .await?;
            apply_episode_totals(&mut items, &episode_totals(episodes.metadata));
        }
        Ok(items)
    }

    async fn get_seasons(&self, show_id: &str) -> Result<Vec<RemoteSeason>> {
        let container: MetadataContainer = self
            .get(&format!("/library/metadata/{}/children", show_id))
            .await?;
        Ok(container
            .metadata
            .into_iter()
            .filter(|m| m.kind == "season")
            .map(|m| RemoteSeason {
                id: m.rating_key,
                index: m.index.unwrap_or(0),
                title: m.title,
                added_at: timestamp(m.added_at),
            })
            .collect())
    }

    async fn delete_item(&self, item_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("/library/metadata/{}", item_id))?;
        let response = self
            .client
            .delete(url)
            .header("X-Plex-Token", &self.token)
            .send()
            .await
            .context("Plex delete request failed")?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }
        Ok(())
    }
}
