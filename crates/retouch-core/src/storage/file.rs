//! File-based project store for native platforms.

use super::{BoxFuture, ProjectRecord, ProjectStore, ProjectUpdate, StoreError, StoreResult, now_millis};
use std::fs;
use std::path::PathBuf;

/// Stores project records as JSON files in a directory.
pub struct FileProjectStore {
    /// Base directory for record storage.
    base_path: PathBuf,
    /// Identity requests are made for.
    viewer: String,
}

impl FileProjectStore {
    /// Create a store rooted at `base_path`, creating the directory if
    /// needed.
    pub fn new(base_path: PathBuf, viewer: impl Into<String>) -> StoreResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StoreError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self {
            base_path,
            viewer: viewer.into(),
        })
    }

    /// Create a store in the default location.
    ///
    /// On Unix: `~/.local/share/retouch/projects/`
    /// On Windows: `%LOCALAPPDATA%\retouch\projects\`
    pub fn default_location(viewer: impl Into<String>) -> StoreResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StoreError::Io("Could not determine home directory".to_string()))?;
        Self::new(base.join("retouch").join("projects"), viewer)
    }

    /// Write a record, bypassing access checks. Used to seed projects.
    pub fn put(&self, record: &ProjectRecord) -> StoreResult<()> {
        let path = self.record_path(&record.id);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(&path, json)
            .map_err(|e| StoreError::Io(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// Get the base path.
    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn record_path(&self, id: &str) -> PathBuf {
        let safe_id: String = id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{}.json", safe_id))
    }

    fn read(&self, id: &str) -> StoreResult<ProjectRecord> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let json = fs::read_to_string(&path)
            .map_err(|e| StoreError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&json)
            .map_err(|e| StoreError::Serialization(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

impl ProjectStore for FileProjectStore {
    fn get_project(&self, id: &str) -> BoxFuture<'_, StoreResult<ProjectRecord>> {
        let id = id.to_string();
        Box::pin(async move {
            let record = self.read(&id)?;
            record.check_owner(&self.viewer)?;
            Ok(record)
        })
    }

    fn update_project(&self, id: &str, update: &ProjectUpdate) -> BoxFuture<'_, StoreResult<()>> {
        let id = id.to_string();
        let update = update.clone();
        Box::pin(async move {
            let mut record = self.read(&id)?;
            record.check_owner(&self.viewer)?;
            record.apply(&update, now_millis());
            self.put(&record)
        })
    }
}
