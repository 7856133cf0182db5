//! Media server adapters
//!
//! Every remote call to Plex, Jellyfin or Emby goes through a
//! [MediaServerAdapter]. Adapters are built from server records by the
//! [AdapterRegistry] and never constructed by callers directly.

pub mod jellyfin;
pub mod plex;
pub mod registry;

#[cfg(test)]
pub mod fake;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{MediaType, UpsertLibraryItem};
use crate::services::maintenance::criteria::resolution_rank;

pub use jellyfin::JellyfinAdapter;
pub use plex::PlexAdapter;
pub use registry::{AdapterFactory, AdapterRegistry, HttpAdapterFactory};

/// Result of a connectivity test
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    /// Stable fingerprint of the physical server (Plex machine identifier,
    /// Jellyfin server id)
    pub machine_id: String,
    pub name: String,
    pub version: Option<String>,
}

/// A library (section) on a remote server
#[derive(Debug, Clone, Serialize)]
pub struct RemoteLibrary {
    pub id: String,
    pub title: String,
    /// `None` for libraries holding neither movies nor shows
    pub media_type: Option<MediaType>,
}

/// A season of a remote show
#[derive(Debug, Clone, Serialize)]
pub struct RemoteSeason {
    pub id: String,
    /// Season number; 0 is specials
    pub index: i32,
    pub title: String,
    pub added_at: Option<DateTime<Utc>>,
}

/// Size and best resolution of one show, accumulated over its episodes.
/// Show listings carry no media of their own on either server family.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct EpisodeTotals {
    pub file_size: i64,
    pub resolution: Option<String>,
}

impl EpisodeTotals {
    pub fn add(&mut self, file_size: i64, resolution: Option<String>) {
        self.file_size += file_size;
        let rank = |r: &Option<String>| r.as_deref().and_then(resolution_rank);
        if rank(&resolution) > rank(&self.resolution) {
            self.resolution = resolution;
        }
    }
}

/// Copy episode totals onto the shows of a listing, keyed by show id
pub(crate) fn apply_episode_totals(
    items: &mut [UpsertLibraryItem],
    totals: &HashMap<String, EpisodeTotals>,
) {
    for item in items.iter_mut().filter(|i| i.media_type == MediaType::Show) {
        if let Some(total) = totals.get(&item.item_id) {
            item.file_size = total.file_size;
            item.resolution = total.resolution.clone();
        }
    }
}

/// Capability set of one media server
#[async_trait]
pub trait MediaServerAdapter: Send + Sync {
    /// Check connectivity and report the server fingerprint
    async fn test_connection(&self) -> Result<ServerInfo>;

    async fn get_libraries(&self) -> Result<Vec<RemoteLibrary>>;

    /// Every movie or show in a library, in cache row shape
    async fn get_library_items(&self, library_id: &str) -> Result<Vec<UpsertLibraryItem>>;

    async fn get_seasons(&self, show_id: &str) -> Result<Vec<RemoteSeason>>;

    /// Delete an item (movie, show or season) by remote id
    async fn delete_item(&self, item_id: &str) -> Result<()>;
}

/// Normalize a vertical resolution into the labels Plex reports
pub fn resolution_label(height: u32) -> &'static str {
    match height {
        h if h >= 1800 => "4k",
        h if h >= 900 => "1080",
        h if h >= 650 => "720",
        h if h >= 560 => "576",
        h if h >= 470 => "480",
        _ => "sd",
    }
}

/// Parse a server URL so relative joins keep any path prefix (reverse proxies)
pub(crate) fn base_url(raw: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(raw.trim())
        .map_err(|e| anyhow::anyhow!("Invalid server URL {}: {}", raw, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("Unsupported URL scheme: {}", url.scheme());
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Read an error response into a message with status and a body excerpt
pub(crate) async fn error_for_status(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();
    if excerpt.trim().is_empty() {
        anyhow::anyhow!("HTTP {}", status)
    } else {
        anyhow::anyhow!("HTTP {}: {}", status, excerpt.trim())
    }
}
