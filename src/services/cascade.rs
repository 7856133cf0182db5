//! Cascade hooks run after a confirmed remote deletion
//!
//! Hooks notify companion services that an item is gone. They are best effort:
//! the deletion pipeline logs their failures and carries on.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use url::Url;

use crate::db::{LibraryItemRecord, MediaType};
use crate::services::resolver_cache::SharedResolverCache;

#[async_trait]
pub trait CascadeHook: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per deleted item, after the remote server confirmed the delete
    async fn on_deleted(&self, item: &LibraryItemRecord) -> Result<()>;
}

/// TVDB id to Sonarr series id
pub type SeriesIndex = HashMap<String, i64>;

const SERIES_INDEX_KEY: &str = "series";

/// Stops Sonarr from monitoring (and re-downloading) a deleted show
pub struct SonarrCascade {
    client: Client,
    base_url: Url,
    api_key: String,
    series_index: SharedResolverCache<SeriesIndex>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SonarrSeries {
    id: i64,
    tvdb_id: Option<i64>,
}

impl SonarrCascade {
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        series_index: SharedResolverCache<SeriesIndex>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Sonarr HTTP client")?;
        Ok(Self {
            client,
            base_url: crate::services::media_server::base_url(base_url)?,
            api_key: api_key.to_string(),
            series_index,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Invalid Sonarr path: {}", path))
    }

    async fn fetch_series_index(&self) -> Result<SeriesIndex> {
        let response = self
            .client
            .get(self.endpoint("api/v3/series")?)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .context("Sonarr series request failed")?
            .error_for_status()
            .context("Sonarr rejected series request")?;
        let series: Vec<SonarrSeries> = response.json().await.context("Invalid Sonarr series list")?;
        Ok(index_series(series))
    }

    async fn unmonitor(&self, series_id: i64) -> Result<()> {
        let url = self.endpoint(&format!("api/v3/series/{}", series_id))?;
        let mut series: JsonValue = self
            .client
            .get(url.clone())
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Invalid Sonarr series")?;
        series["monitored"] = JsonValue::Bool(false);

        self.client
            .put(url)
            .header("X-Api-Key", &self.api_key)
            .json(&series)
            .send()
            .await?
            .error_for_status()
            .context("Sonarr rejected series update")?;
        Ok(())
    }
}

fn index_series(series: Vec<SonarrSeries>) -> SeriesIndex {
    series
        .into_iter()
        .filter_map(|s| s.tvdb_id.filter(|id| *id > 0).map(|tvdb| (tvdb.to_string(), s.id)))
        .collect()
}

#[async_trait]
impl CascadeHook for SonarrCascade {
    fn name(&self) -> &str {
        "sonarr"
    }

    async fn on_deleted(&self, item: &LibraryItemRecord) -> Result<()> {
        if item.media_type != MediaType::Show {
            return Ok(());
        }
        let Some(tvdb_id) = item.tvdb_id.as_deref() else {
            debug!(item_id = item.id, "Show has no TVDB id, skipping Sonarr");
            return Ok(());
        };

        let index = self
            .series_index
            .get_or_fetch(SERIES_INDEX_KEY, || self.fetch_series_index())
            .await?;
        let Some(index) = index else {
            warn!(item_id = item.id, "Sonarr series index is refreshing, skipping unmonitor");
            return Ok(());
        };

        match index.get(tvdb_id) {
            Some(series_id) => {
                self.unmonitor(*series_id).await?;
                info!(series_id, tvdb_id, title = %item.title, "Sonarr series unmonitored");
            }
            None => debug!(tvdb_id, "Show not managed by Sonarr"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_index_skips_missing_tvdb_ids() {
        let series = vec![
            SonarrSeries { id: 1, tvdb_id: Some(280619) },
            SonarrSeries { id: 2, tvdb_id: None },
            SonarrSeries { id: 3, tvdb_id: Some(0) },
        ];
        let index = index_series(series);
        assert_eq!(index.len(), 1);
        assert_eq!(index["280619"], 1);
    }
}
