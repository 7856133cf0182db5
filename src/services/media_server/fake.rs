//! In-memory adapter for tests

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{AdapterFactory, MediaServerAdapter, RemoteLibrary, RemoteSeason, ServerInfo};
use crate::db::{ServerRecord, UpsertLibraryItem};

#[derive(Default)]
pub struct FakeAdapter {
    machine_id: Mutex<String>,
    libraries: Mutex<Vec<RemoteLibrary>>,
    items: Mutex<HashMap<String, Vec<UpsertLibraryItem>>>,
    seasons: Mutex<HashMap<String, Vec<RemoteSeason>>>,
    failing_deletes: Mutex<HashSet<String>>,
    fail_all_deletes: AtomicBool,
    panic_on_fetch: AtomicBool,
    delete_calls: Mutex<Vec<String>>,
    fetch_started: Arc<Notify>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeAdapter {
    pub fn new(machine_id: &str) -> Self {
        Self {
            machine_id: Mutex::new(machine_id.to_string()),
            ..Default::default()
        }
    }

    pub fn set_machine_id(&self, machine_id: &str) {
        *self.machine_id.lock() = machine_id.to_string();
    }

    pub fn set_items(&self, library_id: &str, items: Vec<UpsertLibraryItem>) {
        self.items.lock().insert(library_id.to_string(), items);
    }

    pub fn set_libraries(&self, libraries: Vec<RemoteLibrary>) {
        *self.libraries.lock() = libraries;
    }

    pub fn set_seasons(&self, show_id: &str, seasons: Vec<RemoteSeason>) {
        self.seasons.lock().insert(show_id.to_string(), seasons);
    }

    pub fn fail_delete(&self, item_id: &str) {
        self.failing_deletes.lock().insert(item_id.to_string());
    }

    pub fn fail_all_deletes(&self) {
        self.fail_all_deletes.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_fetch(&self) {
        self.panic_on_fetch.store(true, Ordering::SeqCst);
    }

    /// Block item fetches until the returned handle is notified
    pub fn hold_fetch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.fetch_gate.lock() = Some(gate.clone());
        gate
    }

    /// Resolves once a fetch has started
    pub fn fetch_started(&self) -> Arc<Notify> {
        self.fetch_started.clone()
    }

    /// Remote ids passed to `delete_item`, in call order
    pub fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().clone()
    }
}

#[async_trait]
impl MediaServerAdapter for FakeAdapter {
    async fn test_connection(&self) -> Result<ServerInfo> {
        Ok(ServerInfo {
            machine_id: self.machine_id.lock().clone(),
            name: "Fake".to_string(),
            version: None,
        })
    }

    async fn get_libraries(&self) -> Result<Vec<RemoteLibrary>> {
        Ok(self.libraries.lock().clone())
    }

    async fn get_library_items(&self, library_id: &str) -> Result<Vec<UpsertLibraryItem>> {
        self.fetch_started.notify_one();
        let gate = self.fetch_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.panic_on_fetch.load(Ordering::SeqCst) {
            panic!("fake adapter panicked");
        }
        Ok(self.items.lock().get(library_id).cloned().unwrap_or_default())
    }

    async fn get_seasons(&self, show_id: &str) -> Result<Vec<RemoteSeason>> {
        Ok(self.seasons.lock().get(show_id).cloned().unwrap_or_default())
    }

    async fn delete_item(&self, item_id: &str) -> Result<()> {
        self.delete_calls.lock().push(item_id.to_string());
        if self.fail_all_deletes.load(Ordering::SeqCst)
            || self.failing_deletes.lock().contains(item_id)
        {
            anyhow::bail!("HTTP 500 Internal Server Error");
        }
        Ok(())
    }
}

/// Hands out pre-registered fakes by server id
#[derive(Default)]
pub struct FakeFactory {
    adapters: Mutex<HashMap<i64, Arc<FakeAdapter>>>,
}

impl FakeFactory {
    pub fn insert(&self, server_id: i64, adapter: Arc<FakeAdapter>) {
        self.adapters.lock().insert(server_id, adapter);
    }
}

impl AdapterFactory for FakeFactory {
    fn build(&self, server: &ServerRecord) -> Result<Arc<dyn MediaServerAdapter>> {
        let adapter: Arc<FakeAdapter> = self
            .adapters
            .lock()
            .get(&server.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no fake adapter for server {}", server.id))?;
        let adapter: Arc<dyn MediaServerAdapter> = adapter;
        Ok(adapter)
    }
}
