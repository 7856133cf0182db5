//! Rule criteria
//!
//! The criterion set is closed. Each rule's JSON parameters are parsed into a
//! typed [RuleParams] once per evaluation; parse failures are validation errors.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::db::{LibraryItemRecord, MediaType, RuleCriterion};
use crate::error::{MaintenanceError, MaintenanceResult};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn default_unwatched_days() -> u32 {
    90
}

fn default_stale_days() -> u32 {
    180
}

fn default_keep_seasons() -> u32 {
    1
}

fn default_max_resolution() -> String {
    "sd".to_string()
}

#[derive(Debug, Deserialize)]
struct UnwatchedParams {
    #[serde(default = "default_unwatched_days")]
    days: u32,
}

#[derive(Debug, Deserialize)]
struct StaleParams {
    #[serde(default = "default_stale_days")]
    days: u32,
}

#[derive(Debug, Deserialize)]
struct KeepSeasonsParams {
    #[serde(default = "default_keep_seasons")]
    keep_seasons: u32,
}

#[derive(Debug, Deserialize)]
struct LowResolutionParams {
    #[serde(default = "default_max_resolution")]
    max_resolution: String,
    #[serde(default)]
    days: u32,
}

#[derive(Debug, Deserialize)]
struct LargeFileParams {
    min_size_gb: f64,
    #[serde(default)]
    days: u32,
}

/// A criterion with its parsed parameters
#[derive(Debug, Clone, PartialEq)]
pub enum RuleParams {
    UnwatchedMovie { days: u32 },
    StaleMovie { days: u32 },
    UnwatchedShow { days: u32 },
    StaleShow { days: u32 },
    KeepLatestSeasons { keep_seasons: u32 },
    LowResolution { max_rank: u8, max_label: String, days: u32 },
    LargeFile { min_size_gb: f64, days: u32 },
}

fn parse<T: DeserializeOwned>(criterion: RuleCriterion, params: &JsonValue) -> MaintenanceResult<T> {
    let params = if params.is_null() {
        JsonValue::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| {
        MaintenanceError::Validation(format!("invalid parameters for {}: {}", criterion, e))
    })
}

/// Rank a resolution label; higher is better. `None` for labels we do not know.
pub fn resolution_rank(label: &str) -> Option<u8> {
    let label = label.trim().to_lowercase();
    let label = label.strip_suffix('p').unwrap_or(&label);
    match label {
        "sd" | "360" | "240" => Some(1),
        "480" => Some(2),
        "576" => Some(3),
        "720" | "hd" => Some(4),
        "1080" | "fhd" => Some(5),
        "1440" | "2k" => Some(6),
        "2160" | "4k" | "uhd" => Some(7),
        "4320" | "8k" => Some(8),
        _ => None,
    }
}

impl RuleParams {
    pub fn parse(criterion: RuleCriterion, params: &JsonValue) -> MaintenanceResult<Self> {
        let parsed = match criterion {
            RuleCriterion::UnwatchedMovie => {
                RuleParams::UnwatchedMovie { days: parse::<UnwatchedParams>(criterion, params)?.days }
            }
            RuleCriterion::StaleMovie => {
                RuleParams::StaleMovie { days: parse::<StaleParams>(criterion, params)?.days }
            }
            RuleCriterion::UnwatchedShow => {
                RuleParams::UnwatchedShow { days: parse::<UnwatchedParams>(criterion, params)?.days }
            }
            RuleCriterion::StaleShow => {
                RuleParams::StaleShow { days: parse::<StaleParams>(criterion, params)?.days }
            }
            RuleCriterion::KeepLatestSeasons => {
                let p: KeepSeasonsParams = parse(criterion, params)?;
                if p.keep_seasons == 0 {
                    return Err(MaintenanceError::Validation(
                        "keep_seasons must be at least 1".to_string(),
                    ));
                }
                RuleParams::KeepLatestSeasons { keep_seasons: p.keep_seasons }
            }
            RuleCriterion::LowResolution => {
                let p: LowResolutionParams = parse(criterion, params)?;
                let max_rank = resolution_rank(&p.max_resolution).ok_or_else(|| {
                    MaintenanceError::Validation(format!(
                        "unknown max_resolution: {}",
                        p.max_resolution
                    ))
                })?;
                RuleParams::LowResolution {
                    max_rank,
                    max_label: p.max_resolution.to_lowercase(),
                    days: p.days,
                }
            }
            RuleCriterion::LargeFile => {
                let p: LargeFileParams = parse(criterion, params)?;
                if p.min_size_gb.is_nan() || p.min_size_gb <= 0.0 {
                    return Err(MaintenanceError::Validation(
                        "min_size_gb must be greater than 0".to_string(),
                    ));
                }
                RuleParams::LargeFile { min_size_gb: p.min_size_gb, days: p.days }
            }
        };
        Ok(parsed)
    }

    /// Media type the criterion applies to; `None` for both
    pub fn media_type(&self) -> Option<MediaType> {
        match self {
            RuleParams::UnwatchedMovie { .. } | RuleParams::StaleMovie { .. } => Some(MediaType::Movie),
            RuleParams::UnwatchedShow { .. }
            | RuleParams::StaleShow { .. }
            | RuleParams::KeepLatestSeasons { .. } => Some(MediaType::Show),
            RuleParams::LowResolution { .. } | RuleParams::LargeFile { .. } => None,
        }
    }

    /// Reason the item matches, or `None`
    pub fn matches(&self, item: &LibraryItemRecord, now: DateTime<Utc>) -> Option<String> {
        if let Some(media_type) = self.media_type() {
            if item.media_type != media_type {
                return None;
            }
        }

        match self {
            RuleParams::UnwatchedMovie { days } | RuleParams::UnwatchedShow { days } => {
                if is_watched(item) {
                    return None;
                }
                let age = days_since(item.added_at?, now);
                (age >= i64::from(*days)).then(|| format!("Never watched, added {} days ago", age))
            }
            RuleParams::StaleMovie { days } | RuleParams::StaleShow { days } => {
                let since = days_since(item.last_watched_at?, now);
                (since >= i64::from(*days)).then(|| format!("Last watched {} days ago", since))
            }
            RuleParams::KeepLatestSeasons { keep_seasons } => {
                let seasons = item.season_count.max(0) as u32;
                (seasons > *keep_seasons).then(|| {
                    format!(
                        "{} seasons, keeping the latest {}; {} to remove",
                        seasons,
                        keep_seasons,
                        seasons - keep_seasons
                    )
                })
            }
            RuleParams::LowResolution { max_rank, max_label, days } => {
                let resolution = item.resolution.as_deref()?;
                let rank = resolution_rank(resolution)?;
                (rank <= *max_rank && added_at_least(item, *days, now)).then(|| {
                    format!("Resolution {} is at or below {}", resolution, max_label)
                })
            }
            RuleParams::LargeFile { min_size_gb, days } => {
                let size_gb = item.file_size as f64 / GIB;
                (size_gb >= *min_size_gb && added_at_least(item, *days, now)).then(|| {
                    format!("File size {:.1} GB is at least {} GB", size_gb, min_size_gb)
                })
            }
        }
    }

    /// Seasons to keep, for the season deletion variant
    pub fn keep_seasons(&self) -> Option<u32> {
        match self {
            RuleParams::KeepLatestSeasons { keep_seasons } => Some(*keep_seasons),
            _ => None,
        }
    }
}

fn is_watched(item: &LibraryItemRecord) -> bool {
    item.play_count > 0 || item.last_watched_at.is_some()
}

fn days_since(at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - at).num_days()
}

fn added_at_least(item: &LibraryItemRecord, days: u32, now: DateTime<Utc>) -> bool {
    if days == 0 {
        return true;
    }
    item.added_at
        .is_some_and(|added| added <= now - Duration::days(i64::from(days)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn item(media_type: MediaType, now: DateTime<Utc>) -> LibraryItemRecord {
        LibraryItemRecord {
            id: 1,
            server_id: 1,
            library_id: "1".to_string(),
            item_id: "a".to_string(),
            title: "Alien".to_string(),
            media_type,
            year: Some(1979),
            file_size: 0,
            resolution: None,
            tmdb_id: None,
            tvdb_id: None,
            imdb_id: None,
            season_count: 0,
            play_count: 0,
            last_watched_at: None,
            added_at: Some(now - Duration::days(100)),
            synced_at: now,
        }
    }

    #[test]
    fn test_defaults_apply_to_empty_parameters() {
        assert_eq!(
            RuleParams::parse(RuleCriterion::UnwatchedMovie, &json!({})).unwrap(),
            RuleParams::UnwatchedMovie { days: 90 }
        );
        assert_eq!(
            RuleParams::parse(RuleCriterion::StaleShow, &JsonValue::Null).unwrap(),
            RuleParams::StaleShow { days: 180 }
        );
        assert_eq!(
            RuleParams::parse(RuleCriterion::KeepLatestSeasons, &json!({})).unwrap().keep_seasons(),
            Some(1)
        );
    }

    #[test]
    fn test_invalid_parameters_are_rejected() {
        assert_matches!(
            RuleParams::parse(RuleCriterion::LargeFile, &json!({})),
            Err(MaintenanceError::Validation(_))
        );
        assert_matches!(
            RuleParams::parse(RuleCriterion::UnwatchedMovie, &json!({ "days": -3 })),
            Err(MaintenanceError::Validation(_))
        );
        assert_matches!(
            RuleParams::parse(RuleCriterion::LowResolution, &json!({ "max_resolution": "vhs" })),
            Err(MaintenanceError::Validation(_))
        );
        assert_matches!(
            RuleParams::parse(RuleCriterion::KeepLatestSeasons, &json!({ "keep_seasons": 0 })),
            Err(MaintenanceError::Validation(_))
        );
    }

    #[test]
    fn test_unwatched_movie() {
        let now = Utc::now();
        let rule = RuleParams::UnwatchedMovie { days: 90 };
        let movie = item(MediaType::Movie, now);
        let reason = rule.matches(&movie, now).unwrap();
        assert!(reason.contains("100 days"));

        let mut watched = movie.clone();
        watched.play_count = 1;
        assert_eq!(rule.matches(&watched, now), None);

        let mut fresh = movie.clone();
        fresh.added_at = Some(now - Duration::days(10));
        assert_eq!(rule.matches(&fresh, now), None);

        assert_eq!(rule.matches(&item(MediaType::Show, now), now), None);
    }

    #[test]
    fn test_stale_show_needs_old_last_watch() {
        let now = Utc::now();
        let rule = RuleParams::StaleShow { days: 180 };
        let mut show = item(MediaType::Show, now);
        assert_eq!(rule.matches(&show, now), None);

        show.play_count = 4;
        show.last_watched_at = Some(now - Duration::days(200));
        assert!(rule.matches(&show, now).is_some());

        show.last_watched_at = Some(now - Duration::days(20));
        assert_eq!(rule.matches(&show, now), None);
    }

    #[test]
    fn test_keep_latest_seasons() {
        let now = Utc::now();
        let rule = RuleParams::KeepLatestSeasons { keep_seasons: 2 };
        let mut show = item(MediaType::Show, now);
        show.season_count = 2;
        assert_eq!(rule.matches(&show, now), None);
        show.season_count = 5;
        assert!(rule.matches(&show, now).unwrap().contains("3 to remove"));
    }

    #[test]
    fn test_low_resolution_and_large_file() {
        let now = Utc::now();
        let low = RuleParams::parse(RuleCriterion::LowResolution, &json!({ "max_resolution": "720p" })).unwrap();
        let mut movie = item(MediaType::Movie, now);
        movie.resolution = Some("480".to_string());
        assert!(low.matches(&movie, now).is_some());
        movie.resolution = Some("1080".to_string());
        assert_eq!(low.matches(&movie, now), None);

        let large = RuleParams::parse(
            RuleCriterion::LargeFile,
            &json!({ "min_size_gb": 40, "days": 30 }),
        )
        .unwrap();
        let mut show = item(MediaType::Show, now);
        show.file_size = 50 * 1024 * 1024 * 1024;
        assert!(large.matches(&show, now).unwrap().contains("50.0 GB"));
        show.added_at = Some(now - Duration::days(5));
        assert_eq!(large.matches(&show, now), None);
    }
}
