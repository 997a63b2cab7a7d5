//! External collaborators: the remote project record, image ingress and
//! image fetching.

mod assets;
mod file;
mod http;
mod memory;

pub use assets::{FileImageSource, MemoryAssets};
pub use file::FileProjectStore;
pub use http::{HttpProjectStore, USER_HEADER};
pub use memory::MemoryProjectStore;

use crate::raster::LoadError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Project not found: {0}")]
    NotFound(String),
    #[error("Access denied to project {0}")]
    AccessDenied(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed future for async collaborators.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The remote project record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: String,
    pub title: String,
    pub user_id: String,
    #[serde(default)]
    pub canvas_state: Option<serde_json::Value>,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub original_image_url: Option<String>,
    #[serde(default)]
    pub current_image_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub active_transformations: Option<String>,
    #[serde(default)]
    pub background_removed: Option<bool>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ProjectRecord {
    /// A fresh record for an uploaded image.
    pub fn new(
        title: impl Into<String>,
        user_id: impl Into<String>,
        width: u32,
        height: u32,
        original_image_url: Option<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            user_id: user_id.into(),
            canvas_state: None,
            width,
            height,
            current_image_url: original_image_url.clone(),
            original_image_url,
            thumbnail_url: None,
            active_transformations: None,
            background_removed: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Write the provided fields of `update` and bump `updated_at`.
    pub fn apply(&mut self, update: &ProjectUpdate, now: u64) {
        if let Some(canvas_state) = &update.canvas_state {
            self.canvas_state = Some(canvas_state.clone());
        }
        if let Some(width) = update.width {
            self.width = width;
        }
        if let Some(height) = update.height {
            self.height = height;
        }
        if let Some(url) = &update.current_image_url {
            self.current_image_url = Some(url.clone());
        }
        if let Some(url) = &update.thumbnail_url {
            self.thumbnail_url = Some(url.clone());
        }
        if let Some(active) = &update.active_transformations {
            self.active_transformations = Some(active.clone());
        }
        if let Some(removed) = update.background_removed {
            self.background_removed = Some(removed);
        }
        self.updated_at = now.max(self.updated_at);
    }

    /// Check that `user_id` owns this record.
    pub fn check_owner(&self, user_id: &str) -> StoreResult<()> {
        if self.user_id != user_id {
            return Err(StoreError::AccessDenied(self.id.clone()));
        }
        Ok(())
    }
}

/// Idempotent partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_state: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_transformations: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_removed: Option<bool>,
}

impl ProjectUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Trait for the remote project record.
pub trait ProjectStore: Send + Sync {
    /// Fetch the full record.
    fn get_project(&self, id: &str) -> BoxFuture<'_, StoreResult<ProjectRecord>>;

    /// Write the provided fields of `update`.
    fn update_project(&self, id: &str, update: &ProjectUpdate) -> BoxFuture<'_, StoreResult<()>>;
}

/// Fetches encoded image bytes by URL.
pub trait ImageSource: Send + Sync {
    fn fetch(&self, url: &str) -> BoxFuture<'_, Result<Vec<u8>, LoadError>>;
}

/// Upload errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UploadError {
    #[error("Upload rejected: {0}")]
    Rejected(String),
    #[error("Upload failed: {0}")]
    Io(String),
}

/// What the upload service returns for a stored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedImage {
    pub url: String,
    pub thumbnail_url: String,
    pub width: u32,
    pub height: u32,
}

/// Accepts raw files and stores them.
pub trait UploadService: Send + Sync {
    fn upload(&self, file_name: &str, bytes: Vec<u8>) -> BoxFuture<'_, Result<UploadedImage, UploadError>>;
}
