//! The editing session: single mutable root over the pipeline, history,
//! tools, jobs and sync state.
//!
//! Every state transition goes through an [`EditorSession`] method and ends
//! with observers being notified with a fresh [`SessionContext`].

use crate::canvas::CanvasState;
use crate::config::{ConfigError, SessionConfig};
use crate::export::{ExportError, ExportFormat};
use crate::history::History;
use crate::jobs::{AiError, AiService, JobError, JobHandle, JobManager, JobTicket};
use crate::operation::{AiTask, Operation, RasterPatch};
use crate::pipeline::{Pipeline, PipelineError, apply_operation};
use crate::raster::{Geometry, LoadError, RasterState, RasterStore, SourceLimits};
use crate::storage::{ImageSource, ProjectStore, ProjectUpdate, StoreError, UploadService};
use crate::sync::{SyncController, SyncError, SyncStatus};
use crate::tools::{Gesture, ToolAction, ToolError, ToolId, ToolMachine, ToolSwitch};
use ab_glyph::FontArc;
use image::RgbaImage;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Errors that end a session before it starts.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Project not found: {0}")]
    NotFound(String),
    #[error("Access denied to project {0}")]
    AccessDenied(String),
    #[error("Failed to load image: {0}")]
    Load(#[from] LoadError),
    #[error("Failed to fetch project: {0}")]
    Store(StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Stored canvas state is invalid: {0}")]
    Canvas(String),
    #[error("Failed to replay stored edits: {0}")]
    Replay(PipelineError),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SessionError::NotFound(id),
            StoreError::AccessDenied(id) => SessionError::AccessDenied(id),
            other => SessionError::Store(other),
        }
    }
}

/// Recoverable errors from edit entry points. The session is unchanged when
/// one is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

/// What the UI observes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub active_tool: Option<ToolId>,
    pub processing_message: Option<String>,
    pub can_undo: bool,
    pub can_redo: bool,
    pub status: SyncStatus,
    /// Dismissible message from the last failed job or flush.
    pub error: Option<String>,
}

/// Result of a handled gesture.
#[derive(Debug, Clone)]
pub enum GestureOutcome {
    DraftUpdated,
    Committed(RasterState),
    Submitted(JobTicket),
}

/// Observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(&SessionContext) + Send>;

/// One project's editing session.
pub struct EditorSession {
    project_id: String,
    config: SessionConfig,
    store: Arc<dyn ProjectStore>,
    uploads: Option<Arc<dyn UploadService>>,
    font: Option<FontArc>,
    pipeline: Pipeline,
    history: History,
    tools: ToolMachine,
    jobs: JobManager,
    sync: SyncController,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl EditorSession {
    /// Load the project record, decode its source image and replay the stored
    /// operation log.
    pub async fn open(
        project_id: &str,
        store: Arc<dyn ProjectStore>,
        images: &dyn ImageSource,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let record = store.get_project(project_id).await?;
        let source_url = record
            .original_image_url
            .clone()
            .ok_or_else(|| LoadError::NoSource(project_id.to_string()))?;
        let raster = RasterStore::load(&source_url, images, SourceLimits::from(&config)).await?;

        let canvas = record
            .canvas_state
            .clone()
            .map(CanvasState::from_value)
            .transpose()
            .map_err(|e| SessionError::Canvas(e.to_string()))?;
        let operations = canvas.as_ref().map(|c| c.operations.clone()).unwrap_or_default();
        let pipeline =
            Pipeline::restore(raster, operations, config.max_pixels).map_err(SessionError::Replay)?;
        if let Some(canvas) = &canvas {
            if canvas.geometry() != pipeline.geometry() {
                log::warn!(
                    "Stored geometry {} differs from replayed {}",
                    canvas.geometry(),
                    pipeline.geometry()
                );
            }
        }

        let font = config
            .font_path
            .as_deref()
            .and_then(load_font)
            .or_else(crate::pipeline::text::bundled_font);
        let mut history = History::new(pipeline.current(), config.history_depth);
        history.mark_saved();
        let sync = SyncController::new(config.debounce());
        log::info!(
            "Opened project {} ({}, {} stored edits)",
            project_id,
            pipeline.geometry(),
            pipeline.log().len()
        );

        Ok(Self {
            project_id: project_id.to_string(),
            config,
            store,
            uploads: None,
            font,
            pipeline,
            history,
            tools: ToolMachine::new(),
            jobs: JobManager::new(),
            sync,
            observers: Vec::new(),
            next_observer: 0,
        })
    }

    /// Upload the rendered image on every flush.
    pub fn with_uploads(mut self, uploads: Arc<dyn UploadService>) -> Self {
        self.uploads = Some(uploads);
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Snapshot of the current raster state.
    pub fn current(&self) -> RasterState {
        self.pipeline.current()
    }

    pub fn geometry(&self) -> Geometry {
        self.pipeline.geometry()
    }

    /// The committed operation log.
    pub fn operations(&self) -> &[Operation] {
        self.pipeline.log()
    }

    pub fn tools(&self) -> &ToolMachine {
        &self.tools
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    pub fn last_sync_error(&self) -> Option<&SyncError> {
        self.sync.last_error()
    }

    pub fn context(&self) -> SessionContext {
        let error = self
            .jobs
            .last_error()
            .map(str::to_string)
            .or_else(|| self.sync.last_error().map(|e| e.to_string()));
        SessionContext {
            active_tool: self.tools.active(),
            processing_message: self.jobs.active().map(|job| job.progress_message.clone()),
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
            status: self.sync.status(),
            error,
        }
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&SessionContext) + Send + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) {
        self.observers.retain(|(o, _)| *o != id);
    }

    fn notify(&mut self) {
        let context = self.context();
        for (_, observer) in &mut self.observers {
            observer(&context);
        }
    }

    // --- Tools ---

    pub fn select_tool(&mut self, tool: ToolId) -> ToolSwitch {
        let switch = self.tools.select_tool(tool);
        self.notify();
        switch
    }

    pub fn deselect_tool(&mut self) -> ToolSwitch {
        let switch = self.tools.deselect();
        self.notify();
        switch
    }

    /// Route a gesture through the active tool.
    pub fn handle_gesture(&mut self, gesture: Gesture) -> Result<GestureOutcome, EditError> {
        let geometry = self.geometry();
        let action = self.tools.handle(gesture, geometry)?;
        match action {
            ToolAction::DraftUpdated => {
                self.notify();
                Ok(GestureOutcome::DraftUpdated)
            }
            ToolAction::Commit(op) => {
                let state = self.apply(op.clone())?;
                self.tools.committed(&op);
                Ok(GestureOutcome::Committed(state))
            }
            ToolAction::Submit(task) => self.submit_ai(task).map(GestureOutcome::Submitted),
        }
    }

    /// The adjust draft rendered over the current pixels, while adjust is
    /// active with a non-neutral draft.
    pub fn preview(&self) -> Option<RgbaImage> {
        if self.tools.active() != Some(ToolId::Adjust) || !self.tools.has_pending_adjust() {
            return None;
        }
        let draft = Operation::Adjust(self.tools.adjust_draft());
        match apply_operation(self.pipeline.state(), &draft, self.config.max_pixels) {
            Ok(state) => Some(state.compose(self.font.as_ref())),
            Err(e) => {
                log::debug!("Preview failed: {}", e);
                None
            }
        }
    }

    // --- Pipeline and history ---

    /// Apply an operation inline and record it.
    pub fn apply(&mut self, op: Operation) -> Result<RasterState, EditError> {
        let state = self.pipeline.apply(op.clone())?;
        self.sync.mark_dirty(Instant::now());
        let outcome = self.history.record(op, state.clone());
        if outcome.evicted_unsaved {
            log::debug!("Evicted history not yet saved; pending flush carries it");
        }
        self.notify();
        Ok(state)
    }

    /// Reverse the newest applied operation. No-op at the boundary.
    pub fn undo(&mut self) -> Option<RasterState> {
        let state = self.history.undo()?;
        self.pipeline.rewind(state.clone());
        self.sync.mark_dirty(Instant::now());
        log::debug!("Undo -> {}", state.geometry());
        self.notify();
        Some(state)
    }

    /// Reapply the newest undone operation. No-op at the boundary.
    pub fn redo(&mut self) -> Option<RasterState> {
        let (op, state) = self.history.redo()?;
        self.pipeline.reinstate(op, state.clone());
        self.sync.mark_dirty(Instant::now());
        log::debug!("Redo -> {}", state.geometry());
        self.notify();
        Some(state)
    }

    // --- Jobs ---

    /// Queue an AI task against the current state.
    pub fn submit_ai(&mut self, task: AiTask) -> Result<JobTicket, EditError> {
        let ticket = self.pipeline.apply_async(task, &mut self.jobs)?;
        self.notify();
        Ok(ticket)
    }

    /// Mark a submitted job as dispatched to its service.
    pub fn start_job(&mut self, handle: JobHandle) -> Result<(), EditError> {
        self.jobs.start(handle)?;
        self.notify();
        Ok(())
    }

    pub fn on_job_progress(
        &mut self,
        handle: JobHandle,
        callback: impl FnMut(JobHandle, &str) + Send + 'static,
    ) -> Result<(), EditError> {
        self.jobs.on_progress(handle, callback)?;
        Ok(())
    }

    pub fn report_job_progress(&mut self, handle: JobHandle, message: &str) -> Result<(), EditError> {
        self.jobs.report_progress(handle, message)?;
        self.notify();
        Ok(())
    }

    pub fn cancel_job(&mut self, handle: JobHandle) -> Result<(), EditError> {
        self.jobs.cancel(handle)?;
        self.notify();
        Ok(())
    }

    /// Deliver a job's outcome. A successful result is applied and recorded
    /// like any edit; `Ok(None)` means the result was discarded.
    pub fn complete_job(
        &mut self,
        handle: JobHandle,
        result: Result<RasterPatch, AiError>,
    ) -> Result<Option<RasterState>, EditError> {
        let finished = self.jobs.finish(handle, result, self.pipeline.state());
        let op = match finished {
            Ok(Some(op)) => op,
            Ok(None) => {
                self.notify();
                return Ok(None);
            }
            Err(e) => {
                self.notify();
                return Err(e.into());
            }
        };
        match self.apply(op) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                self.jobs.mark_failed(handle, &e.to_string());
                self.notify();
                Err(e)
            }
        }
    }

    /// Submit a task, run it on `service` and apply the result.
    pub async fn run_ai(&mut self, task: AiTask, service: &dyn AiService) -> Result<Option<RasterState>, EditError> {
        let ticket = self.submit_ai(task)?;
        self.start_job(ticket.handle)?;
        let result = service.run(&ticket.request).await;
        self.complete_job(ticket.handle, result)
    }

    /// Clear the dismissible job error.
    pub fn dismiss_error(&mut self) {
        self.jobs.dismiss_error();
        self.notify();
    }

    // --- Rendering ---

    /// Current pixels with text layers composed.
    pub fn render(&self) -> RgbaImage {
        self.pipeline.state().compose(self.font.as_ref())
    }

    pub fn thumbnail(&self) -> RgbaImage {
        self.pipeline
            .state()
            .thumbnail(self.config.thumbnail_size, self.font.as_ref())
    }

    pub fn export(&self, format: ExportFormat) -> Result<Vec<u8>, EditError> {
        Ok(format.encode(&self.render())?)
    }

    // --- Sync ---

    /// The persisted form of the current state.
    pub fn canvas_state(&self) -> CanvasState {
        CanvasState::new(self.geometry(), self.pipeline.log().to_vec())
    }

    /// Record a change made outside the edit entry points.
    pub fn mark_dirty(&mut self) {
        self.sync.mark_dirty(Instant::now());
        self.notify();
    }

    /// When the next debounced flush is due.
    pub fn next_sync_due(&self) -> Option<Instant> {
        self.sync.next_due()
    }

    /// Flush if the debounce window has elapsed at `now`. Returns whether a
    /// flush ran.
    pub async fn poll_sync_at(&mut self, now: Instant) -> Result<bool, SyncError> {
        if !self.sync.is_due(now) {
            return Ok(false);
        }
        self.flush().await?;
        Ok(true)
    }

    pub async fn poll_sync(&mut self) -> Result<bool, SyncError> {
        self.poll_sync_at(Instant::now()).await
    }

    /// Write the current state to the project record now.
    pub async fn flush(&mut self) -> Result<(), SyncError> {
        let Some(version) = self.sync.begin_flush() else {
            return Ok(());
        };
        log::debug!("Flushing {} version {}", self.project_id, version);
        let result = match self.build_update().await {
            Ok(update) => self
                .store
                .update_project(&self.project_id, &update)
                .await
                .map_err(SyncError::from),
            Err(e) => Err(e),
        };
        let result = self.sync.finish_flush(version, result);
        if result.is_ok() && !self.sync.is_dirty() {
            self.history.mark_saved();
        }
        self.notify();
        result
    }

    async fn build_update(&self) -> Result<ProjectUpdate, SyncError> {
        let canvas = self.canvas_state();
        let mut update = ProjectUpdate {
            canvas_state: Some(canvas.to_value().map_err(|e| SyncError::Serialization(e.to_string()))?),
            width: Some(canvas.width),
            height: Some(canvas.height),
            active_transformations: Some(canvas.active_transformations()),
            background_removed: Some(canvas.background_removed()),
            ..Default::default()
        };
        if let Some(uploads) = &self.uploads {
            let bytes = ExportFormat::Png
                .encode(&self.render())
                .map_err(|e| SyncError::Render(e.to_string()))?;
            let uploaded = uploads.upload(&format!("{}.png", self.project_id), bytes).await?;
            update.current_image_url = Some(uploaded.url);
            update.thumbnail_url = Some(uploaded.thumbnail_url);
        }
        Ok(update)
    }

    /// End the session: cancel outstanding work and make a final flush.
    pub async fn close(mut self) -> Result<(), SyncError> {
        if let Some(handle) = self.jobs.cancel_active() {
            log::info!("Cancelled {} on close", handle);
        }
        self.sync.cancel_pending();
        let result = self.flush().await;
        log::info!("Closed project {}", self.project_id);
        result
    }
}

fn load_font(path: &Path) -> Option<FontArc> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Failed to read font {}: {}, using the bundled font", path.display(), e);
            return None;
        }
    };
    match FontArc::try_from_vec(bytes) {
        Ok(font) => Some(font),
        Err(e) => {
            log::warn!("Invalid font {}: {}, using the bundled font", path.display(), e);
            None
        }
    }
}
