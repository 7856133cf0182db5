//! Adapter registry
//!
//! The single owned mapping from server id to live adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{JellyfinAdapter, MediaServerAdapter, PlexAdapter};
use crate::db::{ServerRecord, ServerType};
use crate::services::resolver_cache::SharedResolverCache;

/// Builds adapters from server records
pub trait AdapterFactory: Send + Sync {
    fn build(&self, server: &ServerRecord) -> Result<Arc<dyn MediaServerAdapter>>;
}

/// Factory for the real HTTP adapters
pub struct HttpAdapterFactory {
    client: reqwest::Client,
    admin_users: SharedResolverCache<String>,
}

impl HttpAdapterFactory {
    pub fn new(request_timeout: Duration, admin_users: SharedResolverCache<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("cullarr/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, admin_users })
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn build(&self, server: &ServerRecord) -> Result<Arc<dyn MediaServerAdapter>> {
        let adapter: Arc<dyn MediaServerAdapter> = match server.server_type {
            ServerType::Plex => Arc::new(PlexAdapter::new(
                self.client.clone(),
                &server.url,
                &server.api_key,
            )?),
            ServerType::Jellyfin | ServerType::Emby => Arc::new(JellyfinAdapter::new(
                self.client.clone(),
                server.id,
                server.server_type,
                &server.url,
                &server.api_key,
                self.admin_users.clone(),
            )?),
        };
        Ok(adapter)
    }
}

pub struct AdapterRegistry {
    factory: Arc<dyn AdapterFactory>,
    adapters: RwLock<HashMap<i64, Arc<dyn MediaServerAdapter>>>,
}

impl AdapterRegistry {
    pub fn new(factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            factory,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Build an adapter without registering it (connectivity tests of unsaved servers)
    pub fn build(&self, server: &ServerRecord) -> Result<Arc<dyn MediaServerAdapter>> {
        self.factory.build(server)
    }

    /// Build and register the adapter for an active server
    pub fn connect(&self, server: &ServerRecord) -> Result<Arc<dyn MediaServerAdapter>> {
        let adapter = self.factory.build(server)?;
        self.add_server(server.id, adapter.clone());
        info!(server_id = server.id, server_type = %server.server_type, "Media server adapter registered");
        Ok(adapter)
    }

    pub fn add_server(&self, id: i64, adapter: Arc<dyn MediaServerAdapter>) {
        self.adapters.write().insert(id, adapter);
    }

    pub fn remove_server(&self, id: i64) -> bool {
        let removed = self.adapters.write().remove(&id).is_some();
        if removed {
            debug!(server_id = id, "Media server adapter removed");
        }
        removed
    }

    pub fn get_server(&self, id: i64) -> Option<Arc<dyn MediaServerAdapter>> {
        self.adapters.read().get(&id).cloned()
    }

    pub fn server_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.adapters.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, fixtures};
    use crate::services::media_server::fake::{FakeAdapter, FakeFactory};

    #[tokio::test]
    async fn test_connect_registers_factory_adapter() {
        let db = Database::in_memory().await.unwrap();
        let server = fixtures::server(&db, "Plex").await;
        let fake = Arc::new(FakeAdapter::new("machine-plex"));
        let factory = Arc::new(FakeFactory::default());
        factory.insert(server.id, fake.clone());
        let registry = AdapterRegistry::new(factory);

        assert!(registry.get_server(server.id).is_none());
        registry.connect(&server).unwrap();
        assert!(registry.get_server(server.id).is_some());
        assert_eq!(registry.server_ids(), vec![server.id]);

        assert!(registry.remove_server(server.id));
        assert!(!registry.remove_server(server.id));
        assert!(registry.get_server(server.id).is_none());
    }

    #[tokio::test]
    async fn test_http_factory_builds_per_server_type() {
        let db = Database::in_memory().await.unwrap();
        let mut server = fixtures::server(&db, "Plex").await;
        let cache = Arc::new(crate::services::resolver_cache::ResolverCache::new(
            "admin_users",
            Duration::from_secs(60),
        ));
        let factory = HttpAdapterFactory::new(Duration::from_secs(5), cache).unwrap();

        assert!(factory.build(&server).is_ok());
        server.server_type = ServerType::Emby;
        assert!(factory.build(&server).is_ok());
        server.url = "::bad::".to_string();
        assert!(factory.build(&server).is_err());
    }
}
