//! Media server management
//!
//! Server configuration changes follow a fixed swap order so that no request
//! ever reaches a server through an adapter built for a different identity:
//! remove the adapter, cancel running syncs, persist, purge cached data when the
//! identity changed, and only then register a fresh adapter.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::db::{CreateServer, Database, ServerRecord, ServerType, UpdateServer};
use crate::error::{MaintenanceError, MaintenanceResult};
use crate::services::media_server::{AdapterRegistry, MediaServerAdapter, RemoteLibrary, ServerInfo};
use crate::services::resolver_cache::SharedResolverCache;
use crate::services::sync::SyncManager;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: ServerType,
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateServerRequest {
    pub name: Option<String>,
    pub server_type: Option<ServerType>,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub enabled: Option<bool>,
}

pub struct ServerService {
    db: Database,
    registry: Arc<AdapterRegistry>,
    sync: Arc<SyncManager>,
    admin_users: SharedResolverCache<String>,
}

impl ServerService {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        sync: Arc<SyncManager>,
        admin_users: SharedResolverCache<String>,
    ) -> Self {
        Self {
            db,
            registry,
            sync,
            admin_users,
        }
    }

    /// Register adapters for every active server. Servers whose adapter cannot be
    /// built are logged and left out.
    pub async fn connect_all(&self) -> MaintenanceResult<usize> {
        let servers = self.db.servers().list_active().await?;
        let mut connected = 0;
        for server in &servers {
            match self.registry.connect(server) {
                Ok(_) => connected += 1,
                Err(e) => error!(server_id = server.id, error = %e, "Failed to build media server adapter"),
            }
        }
        info!(connected, total = servers.len(), "Media server adapters registered");
        Ok(connected)
    }

    pub async fn list(&self) -> MaintenanceResult<Vec<ServerRecord>> {
        Ok(self.db.servers().list().await?)
    }

    pub async fn get(&self, id: i64) -> MaintenanceResult<ServerRecord> {
        self.db
            .servers()
            .get(id)
            .await?
            .filter(|s| s.deleted_at.is_none())
            .ok_or_else(|| MaintenanceError::not_found("server", id))
    }

    /// Connect to an unsaved configuration and return its fingerprint
    async fn probe(&self, server: &ServerRecord) -> MaintenanceResult<ServerInfo> {
        let adapter = self
            .registry
            .build(server)
            .map_err(|e| MaintenanceError::Validation(format!("{:#}", e)))?;
        adapter
            .test_connection()
            .await
            .map_err(|e| MaintenanceError::upstream("connection test", format!("{:#}", e)))
    }

    /// Create a server after a successful connection test. The fingerprint the
    /// server reports becomes part of its identity.
    pub async fn create(&self, input: CreateServerRequest) -> MaintenanceResult<ServerRecord> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(MaintenanceError::Validation("name must not be empty".to_string()));
        }

        let now = chrono::Utc::now();
        let draft = ServerRecord {
            id: 0,
            name: name.clone(),
            server_type: input.server_type,
            url: input.url.trim().to_string(),
            api_key: input.api_key.clone(),
            machine_id: String::new(),
            enabled: input.enabled,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        let info = self.probe(&draft).await?;

        let server = self
            .db
            .servers()
            .create(CreateServer {
                name,
                server_type: draft.server_type,
                url: draft.url,
                api_key: draft.api_key,
                machine_id: info.machine_id,
                enabled: input.enabled,
            })
            .await?;
        info!(server_id = server.id, server_type = %server.server_type, "Media server added");

        if server.is_active() {
            self.registry.connect(&server)?;
        }
        Ok(server)
    }

    pub async fn update(&self, id: i64, input: UpdateServerRequest) -> MaintenanceResult<ServerRecord> {
        let current = self.get(id).await?;

        let mut next = current.clone();
        if let Some(server_type) = input.server_type {
            next.server_type = server_type;
        }
        if let Some(url) = &input.url {
            next.url = url.trim().to_string();
        }
        if let Some(api_key) = &input.api_key {
            next.api_key = api_key.clone();
        }
        if let Some(name) = &input.name {
            if name.trim().is_empty() {
                return Err(MaintenanceError::Validation("name must not be empty".to_string()));
            }
        }

        let connection_changed = next.url != current.url
            || next.server_type != current.server_type
            || next.api_key != current.api_key;
        let machine_id = if connection_changed {
            Some(self.probe(&next).await?.machine_id)
        } else {
            None
        };

        self.registry.remove_server(id);
        let cancelled = self.sync.cancel_server(id);
        if cancelled > 0 {
            info!(server_id = id, cancelled, "Cancelled running syncs before reconfiguring server");
        }

        let persisted = self
            .db
            .servers()
            .update(
                id,
                UpdateServer {
                    name: input.name.map(|n| n.trim().to_string()),
                    server_type: input.server_type,
                    url: input.url.map(|u| u.trim().to_string()),
                    api_key: input.api_key,
                    machine_id,
                    enabled: input.enabled,
                },
            )
            .await;
        let updated = match persisted {
            Ok(Some(updated)) => updated,
            Ok(None) => return Err(MaintenanceError::not_found("server", id)),
            Err(e) => {
                // the old configuration is still the persisted one
                if current.is_active() {
                    if let Err(e) = self.registry.connect(&current) {
                        warn!(server_id = id, error = %e, "Failed to restore adapter");
                    }
                }
                return Err(e.into());
            }
        };

        if connection_changed {
            self.admin_users.invalidate(&id.to_string());
        }
        if updated.identity() != current.identity() {
            let purged = self.db.library_items().delete_for_server(id).await?;
            info!(server_id = id, purged, "Server identity changed, cached library data purged");
        }

        if updated.is_active() {
            self.registry.connect(&updated)?;
        }
        info!(server_id = id, "Media server updated");
        Ok(updated)
    }

    /// Soft delete. Cached rows stay until the next identity purge but the server
    /// is no longer reachable for syncs or deletions.
    pub async fn delete(&self, id: i64) -> MaintenanceResult<()> {
        self.registry.remove_server(id);
        self.sync.cancel_server(id);
        if !self.db.servers().soft_delete(id).await? {
            return Err(MaintenanceError::not_found("server", id));
        }
        self.admin_users.invalidate(&id.to_string());
        info!(server_id = id, "Media server deleted");
        Ok(())
    }

    /// The registered adapter, or a throwaway one for disabled servers
    fn adapter(&self, server: &ServerRecord) -> MaintenanceResult<Arc<dyn MediaServerAdapter>> {
        match self.registry.get_server(server.id) {
            Some(adapter) => Ok(adapter),
            None => Ok(self.registry.build(server)?),
        }
    }

    pub async fn test(&self, id: i64) -> MaintenanceResult<ServerInfo> {
        let server = self.get(id).await?;
        let info = self
            .adapter(&server)?
            .test_connection()
            .await
            .map_err(|e| MaintenanceError::upstream("connection test", format!("{:#}", e)))?;
        if info.machine_id != server.machine_id {
            warn!(
                server_id = id,
                expected = %server.machine_id,
                reported = %info.machine_id,
                "Server reports a different fingerprint"
            );
        }
        Ok(info)
    }

    pub async fn libraries(&self, id: i64) -> MaintenanceResult<Vec<RemoteLibrary>> {
        let server = self.get(id).await?;
        self.adapter(&server)?
            .get_libraries()
            .await
            .map_err(|e| MaintenanceError::upstream("list libraries", format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures;
    use crate::services::maintenance::RuleEvaluator;
    use crate::services::media_server::fake::{FakeAdapter, FakeFactory};
    use crate::services::resolver_cache::ResolverCache;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        db: Database,
        factory: Arc<FakeFactory>,
        registry: Arc<AdapterRegistry>,
        sync: Arc<SyncManager>,
        admin_users: SharedResolverCache<String>,
        service: ServerService,
    }

    async fn harness() -> Harness {
        let db = Database::in_memory().await.unwrap();
        let factory = Arc::new(FakeFactory::default());
        let registry = Arc::new(AdapterRegistry::new(factory.clone()));
        let sync = Arc::new(SyncManager::new(
            db.clone(),
            registry.clone(),
            RuleEvaluator::new(db.clone()),
            CancellationToken::new(),
            Duration::from_secs(30),
        ));
        let admin_users = Arc::new(ResolverCache::new("admin_users", Duration::from_secs(60)));
        let service = ServerService::new(db.clone(), registry.clone(), sync.clone(), admin_users.clone());
        Harness {
            db,
            factory,
            registry,
            sync,
            admin_users,
            service,
        }
    }

    #[tokio::test]
    async fn test_create_records_fingerprint_and_registers_adapter() {
        let h = harness().await;
        let fake = Arc::new(FakeAdapter::new("abc123"));
        // the draft has id 0, the saved record gets id 1
        h.factory.insert(0, fake.clone());
        h.factory.insert(1, fake);

        let server = h
            .service
            .create(CreateServerRequest {
                name: " Den ".to_string(),
                server_type: ServerType::Plex,
                url: "http://den.local:32400".to_string(),
                api_key: "token".to_string(),
                enabled: true,
            })
            .await
            .unwrap();

        assert_eq!(server.name, "Den");
        assert_eq!(server.machine_id, "abc123");
        assert!(h.registry.get_server(server.id).is_some());
    }

    #[tokio::test]
    async fn test_identity_change_purges_cache_and_swaps_adapter() {
        let h = harness().await;
        let (server, items) = fixtures::library(&h.db, &["Alien"]).await;
        let fake = Arc::new(FakeAdapter::new(&server.machine_id));
        h.factory.insert(server.id, fake.clone());
        h.registry.connect(&server).unwrap();
        h.admin_users.set(&server.id.to_string(), "admin".to_string());
        let gate = fake.hold_fetch();
        h.sync.start_sync(server.id, fixtures::LIBRARY).await.unwrap();

        fake.set_machine_id("new-machine");
        let updated = h
            .service
            .update(
                server.id,
                UpdateServerRequest {
                    url: Some("http://other.local:32400".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.machine_id, "new-machine");
        assert!(h.db.library_items().get(items[0].id).await.unwrap().is_none());
        assert!(h.admin_users.is_empty());
        assert!(h.registry.get_server(server.id).is_some());
        for _ in 0..100 {
            if !h.sync.is_running(server.id, fixtures::LIBRARY) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!h.sync.is_running(server.id, fixtures::LIBRARY));
        drop(gate);
    }

    #[tokio::test]
    async fn test_rename_keeps_cache() {
        let h = harness().await;
        let (server, items) = fixtures::library(&h.db, &["Alien"]).await;
        h.factory.insert(server.id, Arc::new(FakeAdapter::new(&server.machine_id)));
        h.registry.connect(&server).unwrap();

        let updated = h
            .service
            .update(
                server.id,
                UpdateServerRequest {
                    name: Some("Living room".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "Living room");
        assert!(h.db.library_items().get(items[0].id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disable_and_delete_unregister_adapter() {
        let h = harness().await;
        let server = fixtures::server(&h.db, "Plex").await;
        h.factory.insert(server.id, Arc::new(FakeAdapter::new(&server.machine_id)));
        h.registry.connect(&server).unwrap();

        h.service
            .update(server.id, UpdateServerRequest { enabled: Some(false), ..Default::default() })
            .await
            .unwrap();
        assert!(h.registry.get_server(server.id).is_none());

        h.service.delete(server.id).await.unwrap();
        assert_matches!(h.service.get(server.id).await, Err(MaintenanceError::NotFound { .. }));
        assert_matches!(h.service.delete(server.id).await, Err(MaintenanceError::NotFound { .. }));
    }
}
