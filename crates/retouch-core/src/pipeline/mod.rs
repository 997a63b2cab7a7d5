//! Transformation pipeline.
//!
//! The effective image is the left-to-right fold of the committed operation
//! log over the base image. Every operation takes the current state as input
//! and yields a new one; nothing is reordered and nothing is mutated in place.

pub mod adjust;
pub mod text;

use crate::jobs::{JobError, JobManager, JobTicket};
use crate::operation::{AiTask, CropRect, ExtendDirection, Operation, RasterPatch};
use crate::raster::{Geometry, Layer, RasterState, RasterStore, TextLayer};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use thiserror::Error;

/// Errors raised by operations. The current state is left unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Crop {rect:?} lies outside the {geometry} raster")]
    OutOfBounds { rect: CropRect, geometry: Geometry },
    #[error("Geometry changed from {expected} to {actual}")]
    StaleBounds { expected: Geometry, actual: Geometry },
    #[error("Pixels were edited while the job was running")]
    StalePixels,
    #[error("Patch does not fit the operation: {0}")]
    PatchMismatch(String),
    #[error("Result would be {geometry}, exceeding the {max} pixel budget")]
    TooLarge { geometry: Geometry, max: u64 },
}

/// Ordered, replayable stack of operations over the raster store.
#[derive(Debug, Clone)]
pub struct Pipeline {
    store: RasterStore,
    log: Vec<Operation>,
    max_pixels: u64,
}

impl Pipeline {
    /// Create a pipeline over a loaded store with an empty log.
    pub fn new(store: RasterStore, max_pixels: u64) -> Self {
        Self {
            store,
            log: Vec::new(),
            max_pixels,
        }
    }

    /// Rebuild a pipeline by replaying a stored log over the store's base.
    pub fn restore(store: RasterStore, log: Vec<Operation>, max_pixels: u64) -> Result<Self, PipelineError> {
        let state = replay_with_budget(&store.current_ref().pristine(), &log, max_pixels)?;
        let mut store = store;
        store.commit(state);
        Ok(Self { store, log, max_pixels })
    }

    /// Snapshot of the current state.
    pub fn current(&self) -> RasterState {
        self.store.current()
    }

    /// Borrow the current state.
    pub fn state(&self) -> &RasterState {
        self.store.current_ref()
    }

    pub fn geometry(&self) -> Geometry {
        self.state().geometry()
    }

    /// The committed operations producing the current state.
    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    /// Apply an operation inline. On failure nothing changes.
    pub fn apply(&mut self, op: Operation) -> Result<RasterState, PipelineError> {
        let next = apply_operation(self.state(), &op, self.max_pixels)?;
        log::debug!("Applied {} -> {}", op.kind(), next.geometry());
        self.store.commit(next.clone());
        self.log.push(op);
        Ok(next)
    }

    /// Hand an AI task to the job manager. The task's recorded bounds must
    /// match the current geometry and an extension must fit the pixel budget.
    pub fn apply_async(&self, task: AiTask, jobs: &mut JobManager) -> Result<JobTicket, JobError> {
        let actual = self.geometry();
        if let AiTask::AiExtend { direction, bounds, amount } = task {
            if bounds != actual {
                return Err(PipelineError::StaleBounds { expected: bounds, actual }.into());
            }
            if amount == 0 {
                return Err(PipelineError::InvalidParameters("extension amount must be positive".into()).into());
            }
            let (target, _) = extension_target(direction, bounds, amount)?;
            check_budget(target, self.max_pixels)?;
        }
        jobs.submit(task, self.current())
    }

    /// Drop the newest operation and reinstate `state`.
    pub(crate) fn rewind(&mut self, state: RasterState) {
        self.log.pop();
        self.store.commit(state);
    }

    /// Reinstate a previously undone operation and its result.
    pub(crate) fn reinstate(&mut self, op: Operation, state: RasterState) {
        self.log.push(op);
        self.store.commit(state);
    }
}

/// Fold `ops` over `base`. AI operations reuse their stored patches.
pub fn replay(base: &RasterState, ops: &[Operation]) -> Result<RasterState, PipelineError> {
    replay_with_budget(base, ops, u64::MAX)
}

fn replay_with_budget(base: &RasterState, ops: &[Operation], max_pixels: u64) -> Result<RasterState, PipelineError> {
    ops.iter()
        .try_fold(base.clone(), |state, op| apply_operation(&state, op, max_pixels))
}

fn extension_target(
    direction: ExtendDirection,
    bounds: Geometry,
    amount: u32,
) -> Result<(Geometry, (u32, u32)), PipelineError> {
    direction.extended(bounds, amount).ok_or_else(|| {
        PipelineError::InvalidParameters(format!("extending {} by {} overflows", bounds, amount))
    })
}

fn check_budget(geometry: Geometry, max_pixels: u64) -> Result<(), PipelineError> {
    if geometry.pixel_count() > max_pixels {
        return Err(PipelineError::TooLarge { geometry, max: max_pixels });
    }
    Ok(())
}

/// Compute the state produced by `op` from `state`.
pub fn apply_operation(state: &RasterState, op: &Operation, max_pixels: u64) -> Result<RasterState, PipelineError> {
    let current = state.geometry();
    match op {
        Operation::Resize { width, height } => {
            if *width == 0 || *height == 0 {
                return Err(PipelineError::InvalidParameters(format!(
                    "resize target {}x{} must be positive",
                    width, height
                )));
            }
            let target = Geometry::new(*width, *height);
            check_budget(target, max_pixels)?;
            let pixels = if target == current {
                (**state.pixels()).clone()
            } else {
                imageops::resize(&**state.pixels(), *width, *height, FilterType::Lanczos3)
            };
            let sx = *width as f64 / current.width as f64;
            let sy = *height as f64 / current.height as f64;
            let layers = state
                .layers()
                .iter()
                .cloned()
                .map(|mut layer| {
                    layer.scale(sx, sy);
                    layer
                })
                .collect();
            Ok(state.derive(pixels, layers))
        }
        Operation::Crop(rect) => {
            if !rect.fits(current) {
                return Err(PipelineError::OutOfBounds { rect: *rect, geometry: current });
            }
            let pixels = imageops::crop_imm(&**state.pixels(), rect.x, rect.y, rect.width, rect.height).to_image();
            let layers = translated(state.layers(), -(rect.x as f64), -(rect.y as f64));
            Ok(state.derive(pixels, layers))
        }
        Operation::Adjust(params) => {
            if !params.is_in_range() {
                return Err(PipelineError::InvalidParameters(format!(
                    "adjustment {:?} outside [-1, 1]",
                    params
                )));
            }
            let pixels = adjust::adjust_pixels(state.pixels(), *params);
            Ok(state.derive(pixels, state.layers().to_vec()))
        }
        Operation::TextOverlay { id, content, style, position } => {
            if content.trim().is_empty() {
                return Err(PipelineError::InvalidParameters("text content is empty".into()));
            }
            if !(style.font_size.is_finite() && style.font_size > 0.0) {
                return Err(PipelineError::InvalidParameters(format!(
                    "font size {} must be positive",
                    style.font_size
                )));
            }
            let inside = position.x >= 0.0
                && position.y >= 0.0
                && position.x < current.width as f64
                && position.y < current.height as f64;
            if !inside {
                return Err(PipelineError::InvalidParameters(format!(
                    "text anchor ({}, {}) outside the {} raster",
                    position.x, position.y, current
                )));
            }
            let mut layers = state.layers().to_vec();
            layers.push(Layer::Text(TextLayer {
                id: *id,
                content: content.clone(),
                style: style.clone(),
                position: *position,
            }));
            Ok(state.with_layers(layers))
        }
        Operation::BackgroundRemove { patch } => {
            let RasterPatch::AlphaMask(mask) = patch else {
                return Err(PipelineError::PatchMismatch(format!("expected alpha mask, got {:?}", patch)));
            };
            expect_geometry(patch.geometry(), current)?;
            let mut pixels = (**state.pixels()).clone();
            for (px, m) in pixels.pixels_mut().zip(mask.pixels()) {
                px[3] = ((px[3] as u16 * m[0] as u16 + 127) / 255) as u8;
            }
            Ok(state.derive(pixels, state.layers().to_vec()))
        }
        Operation::AiExtend { direction, amount, bounds, patch } => {
            expect_geometry(*bounds, current)?;
            let RasterPatch::Extension { canvas, offset_x, offset_y } = patch else {
                return Err(PipelineError::PatchMismatch(format!("expected extension, got {:?}", patch)));
            };
            let (target, offset) = extension_target(*direction, *bounds, *amount)?;
            if patch.geometry() != target || (*offset_x, *offset_y) != offset {
                return Err(PipelineError::PatchMismatch(format!(
                    "extension patch {:?} does not match {} grown {:?} by {}",
                    patch, bounds, direction, amount
                )));
            }
            check_budget(target, max_pixels)?;
            let mut pixels: RgbaImage = (**canvas).clone();
            imageops::replace(&mut pixels, &**state.pixels(), offset.0 as i64, offset.1 as i64);
            let layers = translated(state.layers(), offset.0 as f64, offset.1 as f64);
            Ok(state.derive(pixels, layers))
        }
        Operation::AiEnhance { patch } => {
            let RasterPatch::Pixels(pixels) = patch else {
                return Err(PipelineError::PatchMismatch(format!("expected pixels, got {:?}", patch)));
            };
            expect_geometry(patch.geometry(), current)?;
            Ok(state.derive((**pixels).clone(), state.layers().to_vec()))
        }
    }
}

fn expect_geometry(expected: Geometry, actual: Geometry) -> Result<(), PipelineError> {
    if expected != actual {
        return Err(PipelineError::StaleBounds { expected, actual });
    }
    Ok(())
}

fn translated(layers: &[Layer], dx: f64, dy: f64) -> Vec<Layer> {
    layers
        .iter()
        .cloned()
        .map(|mut layer| {
            layer.translate(dx, dy);
            layer
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{AdjustParams, TextStyle};
    use crate::test_util::{gradient, solid};
    use image::GrayImage;
    use kurbo::Point;
    use std::sync::Arc;
    use uuid::Uuid;

    fn pipeline(width: u32, height: u32) -> Pipeline {
        let state = RasterState::from_base("mem://base.png", gradient(width, height)).unwrap();
        Pipeline::new(RasterStore::from_state(state), u64::MAX)
    }

    fn text_op(x: f64, y: f64) -> Operation {
        Operation::TextOverlay {
            id: Uuid::new_v4(),
            content: "Hello".into(),
            style: TextStyle::default(),
            position: Point::new(x, y),
        }
    }

    #[test]
    fn test_crop_resize_adjust_sequence() {
        let mut p = pipeline(800, 600);
        p.apply(Operation::Crop(CropRect::new(0, 0, 400, 300))).unwrap();
        p.apply(Operation::Resize { width: 800, height: 600 }).unwrap();
        let state = p
            .apply(Operation::Adjust(AdjustParams { brightness: 0.2, ..Default::default() }))
            .unwrap();

        assert_eq!(state.geometry(), Geometry::new(800, 600));
        assert_eq!(p.log().len(), 3);
    }

    #[test]
    fn test_invalid_crop_leaves_state_unchanged() {
        let mut p = pipeline(100, 100);
        let before = p.current();
        let err = p.apply(Operation::Crop(CropRect::new(50, 50, 80, 10))).unwrap_err();

        assert!(matches!(err, PipelineError::OutOfBounds { .. }));
        assert_eq!(p.current(), before);
        assert!(p.log().is_empty());
    }

    #[test]
    fn test_zero_resize_rejected() {
        let mut p = pipeline(10, 10);
        assert!(matches!(
            p.apply(Operation::Resize { width: 0, height: 5 }),
            Err(PipelineError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_resize_respects_budget() {
        let state = RasterState::from_base("mem://base.png", gradient(10, 10)).unwrap();
        let mut p = Pipeline::new(RasterStore::from_state(state), 1_000);
        assert!(matches!(
            p.apply(Operation::Resize { width: 100, height: 100 }),
            Err(PipelineError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_adjust_out_of_range_rejected() {
        let mut p = pipeline(4, 4);
        let op = Operation::Adjust(AdjustParams { brightness: 1.5, ..Default::default() });
        assert!(matches!(p.apply(op), Err(PipelineError::InvalidParameters(_))));
    }

    #[test]
    fn test_replay_reproduces_state() {
        let mut p = pipeline(64, 48);
        p.apply(Operation::Crop(CropRect::new(4, 4, 40, 30))).unwrap();
        p.apply(text_op(5.0, 5.0)).unwrap();
        p.apply(Operation::Adjust(AdjustParams { contrast: 0.3, saturation: -0.4, brightness: 0.1 }))
            .unwrap();
        p.apply(Operation::Resize { width: 20, height: 15 }).unwrap();

        let replayed = replay(&p.state().pristine(), p.log()).unwrap();
        assert_eq!(replayed, p.current());
    }

    #[test]
    fn test_replay_after_serialization() {
        let mut p = pipeline(16, 16);
        p.apply(Operation::Crop(CropRect::new(0, 0, 8, 8))).unwrap();
        p.apply(Operation::BackgroundRemove {
            patch: RasterPatch::AlphaMask(Arc::new(GrayImage::from_pixel(8, 8, image::Luma([0])))),
        })
        .unwrap();

        let json = serde_json::to_string(p.log()).unwrap();
        let log: Vec<Operation> = serde_json::from_str(&json).unwrap();
        let restored = Pipeline::restore(RasterStore::from_state(p.state().pristine()), log, u64::MAX).unwrap();

        assert_eq!(restored.current(), p.current());
    }

    #[test]
    fn test_crop_and_resize_move_text_layers() {
        let mut p = pipeline(100, 100);
        p.apply(text_op(50.0, 40.0)).unwrap();
        p.apply(Operation::Crop(CropRect::new(10, 20, 80, 60))).unwrap();
        p.apply(Operation::Resize { width: 160, height: 120 }).unwrap();

        let Layer::Text(text) = &p.state().layers()[0];
        assert_eq!(text.position, Point::new(80.0, 40.0));
        assert_eq!(text.style.font_size, 64.0);
    }

    #[test]
    fn test_text_outside_raster_rejected() {
        let mut p = pipeline(10, 10);
        assert!(matches!(p.apply(text_op(20.0, 1.0)), Err(PipelineError::InvalidParameters(_))));
    }

    #[test]
    fn test_alpha_mask_multiplies_alpha() {
        let state = RasterState::from_base("mem://base.png", solid(2, 1, [10, 10, 10, 200])).unwrap();
        let mut p = Pipeline::new(RasterStore::from_state(state), u64::MAX);
        let mut mask = GrayImage::new(2, 1);
        mask.put_pixel(0, 0, image::Luma([0]));
        mask.put_pixel(1, 0, image::Luma([255]));

        let out = p
            .apply(Operation::BackgroundRemove { patch: RasterPatch::AlphaMask(Arc::new(mask)) })
            .unwrap();
        assert_eq!(out.pixels().get_pixel(0, 0)[3], 0);
        assert_eq!(out.pixels().get_pixel(1, 0)[3], 200);
    }

    #[test]
    fn test_extension_against_stale_bounds_fails() {
        let mut p = pipeline(800, 600);
        p.apply(Operation::Resize { width: 200, height: 200 }).unwrap();

        let op = Operation::AiExtend {
            direction: ExtendDirection::Right,
            amount: 100,
            bounds: Geometry::new(800, 600),
            patch: RasterPatch::Extension {
                canvas: Arc::new(solid(900, 600, [0, 0, 0, 255])),
                offset_x: 0,
                offset_y: 0,
            },
        };
        assert!(matches!(p.apply(op), Err(PipelineError::StaleBounds { .. })));
        assert_eq!(p.geometry(), Geometry::new(200, 200));
    }

    #[test]
    fn test_extension_keeps_current_pixels() {
        let state = RasterState::from_base("mem://base.png", solid(2, 2, [9, 9, 9, 255])).unwrap();
        let mut p = Pipeline::new(RasterStore::from_state(state), u64::MAX);
        let op = Operation::AiExtend {
            direction: ExtendDirection::Left,
            amount: 1,
            bounds: Geometry::new(2, 2),
            patch: RasterPatch::Extension {
                canvas: Arc::new(solid(3, 2, [200, 0, 0, 255])),
                offset_x: 1,
                offset_y: 0,
            },
        };
        let out = p.apply(op).unwrap();
        assert_eq!(out.geometry(), Geometry::new(3, 2));
        assert_eq!(out.pixels().get_pixel(0, 0).0, [200, 0, 0, 255]);
        assert_eq!(out.pixels().get_pixel(2, 1).0, [9, 9, 9, 255]);
    }

    #[test]
    fn test_wrong_patch_kind_rejected() {
        let mut p = pipeline(4, 4);
        let op = Operation::AiEnhance {
            patch: RasterPatch::AlphaMask(Arc::new(GrayImage::new(4, 4))),
        };
        assert!(matches!(p.apply(op), Err(PipelineError::PatchMismatch(_))));
    }

    #[test]
    fn test_apply_async_checks_bounds() {
        let p = pipeline(50, 50);
        let mut jobs = JobManager::new();
        let stale = AiTask::AiExtend {
            direction: ExtendDirection::Top,
            amount: 10,
            bounds: Geometry::new(40, 40),
        };
        assert!(matches!(
            p.apply_async(stale, &mut jobs),
            Err(JobError::Pipeline(PipelineError::StaleBounds { .. }))
        ));
        assert!(!jobs.is_busy());

        let ticket = p.apply_async(AiTask::BackgroundRemove, &mut jobs).unwrap();
        assert_eq!(ticket.request.geometry, Geometry::new(50, 50));
        assert!(jobs.is_busy());
    }

    #[test]
    fn test_apply_async_rejects_oversized_extension() {
        let state = RasterState::from_base("mem://base.png", gradient(50, 50)).unwrap();
        let p = Pipeline::new(RasterStore::from_state(state), 10_000);
        let mut jobs = JobManager::new();

        let overflowing = AiTask::AiExtend {
            direction: ExtendDirection::All,
            amount: u32::MAX / 2 + 1,
            bounds: Geometry::new(50, 50),
        };
        assert!(matches!(
            p.apply_async(overflowing, &mut jobs),
            Err(JobError::Pipeline(PipelineError::InvalidParameters(_)))
        ));

        let over_budget = AiTask::AiExtend {
            direction: ExtendDirection::Right,
            amount: 200,
            bounds: Geometry::new(50, 50),
        };
        assert!(matches!(
            p.apply_async(over_budget, &mut jobs),
            Err(JobError::Pipeline(PipelineError::TooLarge { .. }))
        ));
        assert!(!jobs.is_busy());

        let fits = AiTask::AiExtend {
            direction: ExtendDirection::Right,
            amount: 50,
            bounds: Geometry::new(50, 50),
        };
        assert!(p.apply_async(fits, &mut jobs).is_ok());
    }
}
