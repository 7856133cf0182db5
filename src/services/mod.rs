//! Application services and media server integrations

pub mod cascade;
pub mod database;
pub mod http_server;
pub mod maintenance;
pub mod manager;
pub mod media_server;
pub mod resolver_cache;
pub mod servers;
pub mod sync;

pub use database::{DatabaseService, DatabaseServiceConfig};
pub use http_server::HttpServerService;
pub use manager::{ServiceHealth, ServicesManager};
pub use servers::ServerService;
pub use sync::{SyncManager, SyncService};
