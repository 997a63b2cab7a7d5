//! Retouch Core Library
//!
//! Runtime-agnostic editing session engine for the Retouch image editor.

pub mod canvas;
pub mod config;
pub mod export;
pub mod history;
pub mod jobs;
pub mod operation;
pub mod pipeline;
pub mod raster;
pub mod session;
pub mod storage;
pub mod sync;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_util;

pub use canvas::CanvasState;
pub use config::SessionConfig;
pub use export::{EXPORT_PRESETS, ExportFormat, ExportPreset};
pub use history::History;
pub use jobs::{AiService, JobHandle, JobManager, JobStatus, LocalAiService};
pub use operation::{AdjustParams, AiTask, CropRect, ExtendDirection, Operation, RasterPatch, TextStyle};
pub use pipeline::{Pipeline, PipelineError};
pub use raster::{Geometry, RasterState, RasterStore};
pub use session::{EditError, EditorSession, SessionContext, SessionError};
pub use storage::{HttpProjectStore, ProjectRecord, ProjectStore, ProjectUpdate, StoreError};
pub use sync::{SyncController, SyncError, SyncStatus};
pub use tools::{Gesture, ToolId, ToolMachine};
