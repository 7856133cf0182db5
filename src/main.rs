//! Cullarr - library sync, retention rules and safe deletion for Plex, Jellyfin
//! and Emby servers.
//!
//! All operations are exposed as REST endpoints under /api.

mod api;
mod app;
mod config;
mod db;
mod error;
mod jobs;
mod services;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::jobs::SchedulerService;
use crate::services::{
    DatabaseService, DatabaseServiceConfig, HttpServerService, ServicesManager, SyncService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cullarr=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Cullarr");
    let config = Arc::new(Config::from_env()?);
    tracing::info!("Configuration loaded");

    let database = Arc::new(
        DatabaseService::from_config(DatabaseServiceConfig {
            database_url: config.database_url.clone(),
            ..Default::default()
        })
        .await?,
    );
    tracing::info!("Database connected");

    // Cancelled by the sync service on stop; running jobs exit before committing
    let shutdown = CancellationToken::new();
    let services = Arc::new(ServicesManager::new());
    let state = AppState::from_config(
        config.clone(),
        database.db().clone(),
        services.clone(),
        shutdown.clone(),
    )?;

    services.register(database).await;
    services
        .register(Arc::new(SyncService::new(state.servers.clone(), shutdown)))
        .await;
    services
        .register(Arc::new(SchedulerService::new(
            state.db.clone(),
            state.sync.clone(),
            &config.sync_cron,
        )))
        .await;
    services.register(Arc::new(HttpServerService::new(state))).await;

    services.start_all().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    services.stop_all().await?;
    Ok(())
}
