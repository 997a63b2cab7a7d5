//! Debounced persistence bookkeeping.
//!
//! The controller never performs I/O itself. It tracks versions, decides when
//! a flush is due and guarantees that at most one flush is in flight; the
//! session performs the write between [`SyncController::begin_flush`] and
//! [`SyncController::finish_flush`]. Time is passed in explicitly.

use crate::storage::{StoreError, UploadError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Sync errors. Retained until the next successful flush.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("Failed to save project: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to upload image: {0}")]
    Upload(#[from] UploadError),
    #[error("Failed to serialize canvas state: {0}")]
    Serialization(String),
    #[error("Failed to render image: {0}")]
    Render(String),
}

/// Coarse sync status exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
}

/// Whether local state diverged from the last confirmed remote write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncRecord {
    pub last_saved_version: u64,
    pub pending_version: u64,
    pub last_error: Option<SyncError>,
}

/// Tracks dirty marks, the debounce window and the single in-flight flush.
#[derive(Debug, Clone)]
pub struct SyncController {
    record: SyncRecord,
    debounce: Duration,
    /// Time of the latest dirty mark not yet absorbed by a flush.
    dirty_at: Option<Instant>,
    in_flight: Option<u64>,
}

impl SyncController {
    pub fn new(debounce: Duration) -> Self {
        Self {
            record: SyncRecord::default(),
            debounce,
            dirty_at: None,
            in_flight: None,
        }
    }

    pub fn record(&self) -> &SyncRecord {
        &self.record
    }

    pub fn last_error(&self) -> Option<&SyncError> {
        self.record.last_error.as_ref()
    }

    pub fn is_dirty(&self) -> bool {
        self.record.pending_version > self.record.last_saved_version
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    pub fn status(&self) -> SyncStatus {
        if self.record.last_error.is_some() {
            SyncStatus::Error
        } else if self.is_dirty() || self.in_flight.is_some() {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        }
    }

    /// Record a local change. Restarts the quiescence window. Marks made
    /// while a flush is in flight are absorbed into one trailing flush.
    pub fn mark_dirty(&mut self, now: Instant) -> u64 {
        self.record.pending_version += 1;
        self.dirty_at = Some(now);
        if self.in_flight.is_some() {
            log::debug!("Dirty mark during flush, trailing flush scheduled");
        }
        self.record.pending_version
    }

    /// When the pending flush becomes due, if one is scheduled.
    pub fn next_due(&self) -> Option<Instant> {
        self.dirty_at.map(|at| at + self.debounce)
    }

    /// Whether a debounced flush should start now.
    pub fn is_due(&self, now: Instant) -> bool {
        self.in_flight.is_none() && self.is_dirty() && self.next_due().is_some_and(|due| now >= due)
    }

    /// Start a flush of the latest version. Returns `None` when a flush is
    /// already in flight or there is nothing to write.
    pub fn begin_flush(&mut self) -> Option<u64> {
        if self.in_flight.is_some() {
            return None;
        }
        if !self.is_dirty() && self.record.last_error.is_none() {
            return None;
        }
        let version = self.record.pending_version;
        self.in_flight = Some(version);
        self.dirty_at = None;
        Some(version)
    }

    /// Complete the in-flight flush of `version`.
    pub fn finish_flush(&mut self, version: u64, result: Result<(), SyncError>) -> Result<(), SyncError> {
        if self.in_flight == Some(version) {
            self.in_flight = None;
        }
        match result {
            Ok(()) => {
                self.record.last_saved_version = self.record.last_saved_version.max(version);
                self.record.last_error = None;
                log::info!("Saved version {}", version);
                Ok(())
            }
            Err(e) => {
                log::warn!("Flush of version {} failed: {}", version, e);
                self.record.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Drop the scheduled debounce. Dirty state is kept.
    pub fn cancel_pending(&mut self) {
        self.dirty_at = None;
    }
}
