//! In-memory collaborators for ephemeral hosts and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use loom_protocol::{EventEnvelope, RunInfo};
use serde_json::Value;

use crate::collaborators::{ListenerCallback, ListenerId, RunStore, SnapshotCache, Transport};
use crate::error::{Result, SessionError};
use crate::lock_unpoisoned;
use crate::snapshot::SnapshotKey;

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, RunInfo>>,
    events: Mutex<HashMap<String, Vec<EventEnvelope>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_run(&self, run: RunInfo) {
        lock_unpoisoned(&self.runs).insert(run.id.clone(), run);
    }

    pub fn set_events(&self, run_id: &str, events: Vec<EventEnvelope>) {
        lock_unpoisoned(&self.events).insert(run_id.to_string(), events);
    }

    pub fn run(&self, run_id: &str) -> Option<RunInfo> {
        lock_unpoisoned(&self.runs).get(run_id).cloned()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn get_run(&self, run_id: &str) -> Result<Option<RunInfo>> {
        Ok(self.run(run_id))
    }

    async fn load_events(&self, run_id: &str) -> Result<Vec<EventEnvelope>> {
        Ok(lock_unpoisoned(&self.events)
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotCache {
    entries: Mutex<HashMap<SnapshotKey, Vec<u8>>>,
}

impl MemorySnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &SnapshotKey) -> bool {
        lock_unpoisoned(&self.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert_raw(&self, key: SnapshotKey, bytes: Vec<u8>) {
        lock_unpoisoned(&self.entries).insert(key, bytes);
    }
}

#[async_trait]
impl SnapshotCache for MemorySnapshotCache {
    async fn load(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>> {
        Ok(lock_unpoisoned(&self.entries).get(key).cloned())
    }

    async fn store(&self, key: &SnapshotKey, bytes: Vec<u8>) -> Result<()> {
        lock_unpoisoned(&self.entries).insert(key.clone(), bytes);
        Ok(())
    }

    async fn invalidate(&self, run_id: &str) -> Result<()> {
        lock_unpoisoned(&self.entries).retain(|key, _| key.run_id != run_id);
        Ok(())
    }
}

/// Synchronous transport: `emit` invokes listeners on the caller's thread.
#[derive(Default)]
pub struct InProcessTransport {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<ListenerId, (String, ListenerCallback)>>,
    failing: Mutex<HashSet<String>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes registration of `name` fail from now on.
    pub fn fail_registration(&self, name: &str) {
        lock_unpoisoned(&self.failing).insert(name.to_string());
    }

    pub fn listener_count(&self) -> usize {
        lock_unpoisoned(&self.listeners).len()
    }

    pub fn listener_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_unpoisoned(&self.listeners)
            .values()
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn emit(&self, name: &str, payload: Value) -> usize {
        let callbacks: Vec<ListenerCallback> = lock_unpoisoned(&self.listeners)
            .values()
            .filter(|(listener, _)| listener == name)
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in &callbacks {
            callback(payload.clone());
        }
        callbacks.len()
    }
}

impl Transport for InProcessTransport {
    fn listen(&self, name: &str, callback: ListenerCallback) -> Result<ListenerId> {
        if lock_unpoisoned(&self.failing).contains(name) {
            return Err(SessionError::Transport {
                name: name.to_string(),
                message: "registration refused".to_string(),
            });
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock_unpoisoned(&self.listeners).insert(id, (name.to_string(), callback));
        Ok(id)
    }

    fn unlisten(&self, id: ListenerId) {
        lock_unpoisoned(&self.listeners).remove(&id);
    }
}
