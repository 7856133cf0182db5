//! Lookup cache that bounds concurrent upstream fetches to one per key
//!
//! Values that are slow to fetch and shared by many callers (the admin user of a
//! Jellyfin server, the Sonarr series index) go through [ResolverCache]. When an
//! entry is missing or expired, the first caller claims the refresh by writing a
//! short claim expiry; callers arriving during the refresh get the stale value, or
//! `None` when there is nothing cached yet, instead of issuing the same request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::debug;

/// How long a refresh claim holds off other callers
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(10);

struct CacheEntry<T> {
    value: Option<T>,
    expires_at: Instant,
}

pub struct ResolverCache<T: Clone + Send + Sync> {
    name: &'static str,
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    ttl: Duration,
    claim_ttl: Duration,
}

impl<T: Clone + Send + Sync> ResolverCache<T> {
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self::with_claim_ttl(name, ttl, DEFAULT_CLAIM_TTL)
    }

    pub fn with_claim_ttl(name: &'static str, ttl: Duration, claim_ttl: Duration) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
            ttl,
            claim_ttl,
        }
    }

    /// Return the cached value for `key`, fetching it when missing or expired.
    ///
    /// `Ok(None)` means another caller is refreshing an entry that has no previous
    /// value. Fetch errors are returned only to the caller that ran the fetch.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                if Instant::now() < entry.expires_at {
                    return Ok(entry.value.clone());
                }
            }
        }

        {
            let mut entries = self.entries.write();
            let now = Instant::now();
            match entries.get_mut(key) {
                // Refreshed or claimed between the two locks
                Some(entry) if now < entry.expires_at => return Ok(entry.value.clone()),
                Some(entry) => entry.expires_at = now + self.claim_ttl,
                None => {
                    entries.insert(
                        key.to_string(),
                        CacheEntry {
                            value: None,
                            expires_at: now + self.claim_ttl,
                        },
                    );
                }
            }
        }

        debug!(cache = self.name, key = %key, "Refreshing resolver cache entry");
        match fetch().await {
            Ok(value) => {
                self.entries.write().insert(
                    key.to_string(),
                    CacheEntry {
                        value: Some(value.clone()),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
                Ok(Some(value))
            }
            Err(e) => {
                let mut entries = self.entries.write();
                entries.remove(key);
                let now = Instant::now();
                entries.retain(|_, entry| entry.expires_at > now);
                Err(e)
            }
        }
    }

    #[cfg(test)]
    /// Store a value with the full TTL
    pub fn set(&self, key: &str, value: T) {
        self.entries.write().insert(
            key.to_string(),
            CacheEntry {
                value: Some(value),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop one entry
    pub fn invalidate(&self, key: &str) {
        self.entries.write().remove(key);
    }

    #[cfg(test)]
    /// Drop every entry
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            debug!(cache = self.name, count = entries.len(), "Clearing resolver cache");
        }
        entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared cache instance type
pub type SharedResolverCache<T> = Arc<ResolverCache<T>>;
