//! Application state and HTTP router construction.
//!
//! Used by [main] and by [HttpServerService](crate::services::http_server::HttpServerService)
//! to build the Axum app.

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api;
use crate::config::Config;
use crate::db::Database;
use crate::services::cascade::{CascadeHook, SonarrCascade};
use crate::services::maintenance::{
    BulkDeleteOrchestrator, DeletionPipeline, ExclusionService, RuleEvaluator,
};
use crate::services::media_server::{AdapterFactory, AdapterRegistry, HttpAdapterFactory};
use crate::services::resolver_cache::{ResolverCache, SharedResolverCache};
use crate::services::{ServerService, ServicesManager, SyncManager};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub services: Arc<ServicesManager>,
    pub registry: Arc<AdapterRegistry>,
    pub servers: Arc<ServerService>,
    pub sync: Arc<SyncManager>,
    pub evaluator: RuleEvaluator,
    pub exclusions: ExclusionService,
    pub deletion: Arc<DeletionPipeline>,
    pub bulk: Arc<BulkDeleteOrchestrator>,
}

impl AppState {
    /// Wire the production adapters and cascade hooks from `config`.
    pub fn from_config(
        config: Arc<Config>,
        db: Database,
        services: Arc<ServicesManager>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let admin_users: SharedResolverCache<String> =
            Arc::new(ResolverCache::new("admin_users", config.resolver_cache_ttl));
        let factory = Arc::new(HttpAdapterFactory::new(
            config.deletion.remote_timeout,
            admin_users.clone(),
        )?);

        let mut hooks: Vec<Arc<dyn CascadeHook>> = Vec::new();
        if let (Some(url), Some(key)) = (&config.sonarr_url, &config.sonarr_api_key) {
            let series_index = Arc::new(ResolverCache::new("sonarr_series", config.resolver_cache_ttl));
            hooks.push(Arc::new(SonarrCascade::new(
                url,
                key,
                config.deletion.remote_timeout,
                series_index,
            )?));
            info!(url = %url, "Sonarr cascade enabled");
        }

        Ok(Self::build(config, db, services, factory, hooks, admin_users, shutdown))
    }

    /// Wire every maintenance component over one database and adapter registry.
    pub fn build(
        config: Arc<Config>,
        db: Database,
        services: Arc<ServicesManager>,
        factory: Arc<dyn AdapterFactory>,
        hooks: Vec<Arc<dyn CascadeHook>>,
        admin_users: SharedResolverCache<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(AdapterRegistry::new(factory));
        let evaluator = RuleEvaluator::new(db.clone());
        let sync = Arc::new(SyncManager::new(
            db.clone(),
            registry.clone(),
            evaluator.clone(),
            shutdown,
            config.sync_job_timeout,
        ));
        let servers = Arc::new(ServerService::new(
            db.clone(),
            registry.clone(),
            sync.clone(),
            admin_users,
        ));
        let deletion = Arc::new(DeletionPipeline::new(
            db.clone(),
            registry.clone(),
            hooks,
            config.deletion.clone(),
        ));
        let bulk = Arc::new(BulkDeleteOrchestrator::new(
            deletion.clone(),
            config.bulk_delete.clone(),
        ));

        Self {
            exclusions: ExclusionService::new(db.clone()),
            config,
            db,
            services,
            registry,
            servers,
            sync,
            evaluator,
            deletion,
            bulk,
        }
    }
}

/// Build the full Axum router: health at the root, everything else under /api.
pub fn build_app(state: AppState) -> Router<()> {
    Router::new()
        .merge(api::health::router())
        .nest("/api", api::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
