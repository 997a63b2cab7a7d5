//! In-memory project store.

use super::{BoxFuture, ProjectRecord, ProjectStore, ProjectUpdate, StoreError, StoreResult, now_millis};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-memory project store for tests and offline sessions.
///
/// Requests are made on behalf of `viewer`; records owned by anyone else
/// are denied.
pub struct MemoryProjectStore {
    viewer: String,
    records: RwLock<HashMap<String, ProjectRecord>>,
    writes: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryProjectStore {
    /// Create an empty store viewed by `viewer`.
    pub fn new(viewer: impl Into<String>) -> Self {
        Self {
            viewer: viewer.into(),
            records: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }

    /// Insert or replace a record directly.
    pub fn insert(&self, record: ProjectRecord) {
        if let Ok(mut records) = self.records.write() {
            records.insert(record.id.clone(), record);
        }
    }

    /// Read a record directly, bypassing access checks.
    pub fn get(&self, id: &str) -> Option<ProjectRecord> {
        self.records.read().ok().and_then(|records| records.get(id).cloned())
    }

    /// Number of successful `update_project` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulate a network outage: every request fails with an IO error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Io("network unreachable".to_string()));
        }
        Ok(())
    }
}

impl ProjectStore for MemoryProjectStore {
    fn get_project(&self, id: &str) -> BoxFuture<'_, StoreResult<ProjectRecord>> {
        let id = id.to_string();
        Box::pin(async move {
            self.check_online()?;
            let records = self
                .records
                .read()
                .map_err(|e| StoreError::Other(format!("Lock error: {}", e)))?;
            let record = records.get(&id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
            record.check_owner(&self.viewer)?;
            Ok(record.clone())
        })
    }

    fn update_project(&self, id: &str, update: &ProjectUpdate) -> BoxFuture<'_, StoreResult<()>> {
        let id = id.to_string();
        let update = update.clone();
        Box::pin(async move {
            self.check_online()?;
            let mut records = self
                .records
                .write()
                .map_err(|e| StoreError::Other(format!("Lock error: {}", e)))?;
            let record = records.get_mut(&id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
            record.check_owner(&self.viewer)?;
            record.apply(&update, now_millis());
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
