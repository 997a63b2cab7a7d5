//! Asynchronous AI jobs.
//!
//! The manager owns a single slot per session: one job may be queued or
//! running at a time. Callers dispatch the [`AiRequest`] in a ticket to an
//! [`AiService`] however they like and report the outcome back through
//! [`JobManager::finish`]. Results for cancelled jobs are discarded.

mod local;

pub use local::LocalAiService;

use crate::operation::{AiTask, Operation, RasterPatch};
use crate::pipeline::PipelineError;
use crate::raster::{Geometry, RasterState};
use crate::storage::BoxFuture;
use image::RgbaImage;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Number of finished jobs whose status stays queryable.
const FINISHED_JOBS_KEPT: usize = 16;

/// Identifies one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(u64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Job errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("Another AI job ({running}) is in progress, please wait")]
    Busy { running: JobHandle },
    #[error("Unknown job {0}")]
    UnknownJob(JobHandle),
    #[error("AI service failed: {0}")]
    Service(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Errors reported by AI services.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AiError {
    #[error("{0}")]
    Failed(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Shared flag used to propagate cooperative cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything an AI service needs to run one job.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub handle: JobHandle,
    pub task: AiTask,
    /// Pixels at submission time.
    pub image: Arc<RgbaImage>,
    pub geometry: Geometry,
    pub cancel: CancelToken,
}

/// Returned by a successful submission.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub handle: JobHandle,
    pub request: AiRequest,
}

/// A black-box asynchronous AI collaborator.
pub trait AiService: Send + Sync {
    /// Run one request and return its patch.
    fn run(&self, request: &AiRequest) -> BoxFuture<'_, Result<RasterPatch, AiError>>;

    /// Whether the service observes [`CancelToken`]s.
    fn supports_cancellation(&self) -> bool {
        false
    }
}

/// An active job.
#[derive(Debug, Clone)]
pub struct Job {
    pub handle: JobHandle,
    pub task: AiTask,
    pub status: JobStatus,
    pub progress_message: String,
    /// Geometry the job was computed against.
    pub geometry: Geometry,
    /// Pixels the job was computed from.
    source: Arc<RgbaImage>,
    cancel: CancelToken,
}

type ProgressCallback = Box<dyn FnMut(JobHandle, &str) + Send>;

/// Schedules AI jobs, one at a time.
#[derive(Default)]
pub struct JobManager {
    next_id: u64,
    active: Option<Job>,
    /// Cancelled jobs whose late result has not arrived yet.
    cancelled: HashSet<JobHandle>,
    finished: VecDeque<(JobHandle, JobStatus)>,
    progress_callbacks: Vec<(JobHandle, ProgressCallback)>,
    last_error: Option<String>,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("active", &self.active)
            .field("cancelled", &self.cancelled)
            .field("finished", &self.finished)
            .finish()
    }
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a job occupies the slot.
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// The active job, if any.
    pub fn active(&self) -> Option<&Job> {
        self.active.as_ref()
    }

    /// Status of an active or recently finished job.
    pub fn status(&self, handle: JobHandle) -> Option<JobStatus> {
        if let Some(job) = self.active.as_ref().filter(|j| j.handle == handle) {
            return Some(job.status);
        }
        if self.cancelled.contains(&handle) {
            return Some(JobStatus::Cancelled);
        }
        self.finished
            .iter()
            .rev()
            .find(|(h, _)| *h == handle)
            .map(|(_, status)| *status)
    }

    /// Message of the most recent failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Clear the last failure message.
    pub fn dismiss_error(&mut self) {
        self.last_error = None;
    }

    /// Queue a task against a snapshot. Fails with [`JobError::Busy`] when the
    /// slot is taken.
    pub fn submit(&mut self, task: AiTask, snapshot: RasterState) -> Result<JobTicket, JobError> {
        if let Some(job) = &self.active {
            return Err(JobError::Busy { running: job.handle });
        }
        self.next_id += 1;
        let handle = JobHandle(self.next_id);
        let cancel = CancelToken::default();
        let geometry = snapshot.geometry();

        self.active = Some(Job {
            handle,
            task,
            status: JobStatus::Queued,
            progress_message: task.processing_message().to_string(),
            geometry,
            source: snapshot.pixels().clone(),
            cancel: cancel.clone(),
        });
        log::info!("Queued {} ({:?}) against {}", handle, task, geometry);

        Ok(JobTicket {
            handle,
            request: AiRequest {
                handle,
                task,
                image: snapshot.pixels().clone(),
                geometry,
                cancel,
            },
        })
    }

    /// Mark the queued job as dispatched.
    pub fn start(&mut self, handle: JobHandle) -> Result<(), JobError> {
        let job = self.active_mut(handle)?;
        if job.status == JobStatus::Queued {
            job.status = JobStatus::Running;
            log::debug!("{} running", handle);
        }
        Ok(())
    }

    /// Register a progress observer for a job.
    pub fn on_progress(
        &mut self,
        handle: JobHandle,
        callback: impl FnMut(JobHandle, &str) + Send + 'static,
    ) -> Result<(), JobError> {
        self.active_mut(handle)?;
        self.progress_callbacks.push((handle, Box::new(callback)));
        Ok(())
    }

    /// Record a progress message from the service.
    pub fn report_progress(&mut self, handle: JobHandle, message: &str) -> Result<(), JobError> {
        let job = self.active_mut(handle)?;
        job.progress_message = message.to_string();
        for (h, callback) in &mut self.progress_callbacks {
            if *h == handle {
                callback(handle, message);
            }
        }
        Ok(())
    }

    /// Cancel a job. The token is tripped for services that cooperate; in
    /// any case a late result is discarded. Frees the slot.
    pub fn cancel(&mut self, handle: JobHandle) -> Result<(), JobError> {
        let job = self.active_mut(handle)?;
        job.cancel.cancel();
        self.active = None;
        self.cancelled.insert(handle);
        self.progress_callbacks.retain(|(h, _)| *h != handle);
        log::info!("Cancelled {}", handle);
        Ok(())
    }

    /// Cancel whatever occupies the slot.
    pub fn cancel_active(&mut self) -> Option<JobHandle> {
        let handle = self.active.as_ref()?.handle;
        self.cancel(handle).ok().map(|_| handle)
    }

    /// Report a job's outcome.
    ///
    /// Returns `Ok(Some(op))` with the resolved operation for the caller to
    /// apply, `Ok(None)` when a cancelled job's late result was discarded,
    /// and an error when the service failed, the `current` geometry no longer
    /// matches the job's, or a pixel-replacing job's source pixels were
    /// edited meanwhile. Failures are never retried.
    pub fn finish(
        &mut self,
        handle: JobHandle,
        result: Result<RasterPatch, AiError>,
        current: &RasterState,
    ) -> Result<Option<Operation>, JobError> {
        if self.cancelled.remove(&handle) {
            log::info!("Discarded late result of cancelled {}", handle);
            self.record_finished(handle, JobStatus::Cancelled);
            return Ok(None);
        }
        let job = match self.active.take() {
            Some(job) if job.handle == handle => job,
            other => {
                self.active = other;
                return Err(JobError::UnknownJob(handle));
            }
        };
        self.progress_callbacks.retain(|(h, _)| *h != handle);

        let outcome = match result {
            Err(AiError::Cancelled) => {
                self.record_finished(handle, JobStatus::Cancelled);
                return Ok(None);
            }
            Err(e) => Err(JobError::Service(e.to_string())),
            Ok(_) if current.geometry() != job.geometry => Err(JobError::Pipeline(PipelineError::StaleBounds {
                expected: job.geometry,
                actual: current.geometry(),
            })),
            Ok(_) if job.task.replaces_pixels() && !Arc::ptr_eq(&job.source, current.pixels()) => {
                Err(JobError::Pipeline(PipelineError::StalePixels))
            }
            Ok(patch) => Ok(job.task.resolve(patch)),
        };

        match outcome {
            Ok(op) => {
                log::info!("{} succeeded", handle);
                self.record_finished(handle, JobStatus::Succeeded);
                Ok(Some(op))
            }
            Err(e) => {
                log::warn!("{} failed: {}", handle, e);
                self.last_error = Some(e.to_string());
                self.record_finished(handle, JobStatus::Failed);
                Err(e)
            }
        }
    }

    /// Record that a succeeded job's operation could not be applied.
    pub(crate) fn mark_failed(&mut self, handle: JobHandle, error: &str) {
        self.last_error = Some(error.to_string());
        if let Some(entry) = self.finished.iter_mut().rev().find(|(h, _)| *h == handle) {
            entry.1 = JobStatus::Failed;
        }
    }

    fn active_mut(&mut self, handle: JobHandle) -> Result<&mut Job, JobError> {
        self.active
            .as_mut()
            .filter(|job| job.handle == handle)
            .ok_or(JobError::UnknownJob(handle))
    }

    fn record_finished(&mut self, handle: JobHandle, status: JobStatus) {
        self.finished.push_back((handle, status));
        while self.finished.len() > FINISHED_JOBS_KEPT {
            self.finished.pop_front();
        }
    }
}
