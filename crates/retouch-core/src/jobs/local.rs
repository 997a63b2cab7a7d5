//! In-process stand-in for the remote AI services.
//!
//! Deterministic approximations: background removal floods the border
//! color, extension replicates edge pixels, enhancement applies a mild
//! contrast and saturation lift.

use super::{AiError, AiRequest, AiService};
use crate::operation::{AdjustParams, AiTask, RasterPatch};
use crate::pipeline::adjust::adjust_pixels;
use crate::storage::BoxFuture;
use image::{GrayImage, Luma, Rgba, RgbaImage};
use std::collections::VecDeque;
use std::sync::Arc;

/// Local AI service.
#[derive(Debug, Clone)]
pub struct LocalAiService {
    /// Max-channel distance (0..255) under which a pixel counts as background.
    pub tolerance: u8,
}

impl Default for LocalAiService {
    fn default() -> Self {
        Self { tolerance: 40 }
    }
}

impl AiService for LocalAiService {
    fn run(&self, request: &AiRequest) -> BoxFuture<'_, Result<RasterPatch, AiError>> {
        let request = request.clone();
        Box::pin(async move {
            if request.cancel.is_cancelled() {
                return Err(AiError::Cancelled);
            }
            let image = &*request.image;
            let patch = match request.task {
                AiTask::BackgroundRemove => RasterPatch::AlphaMask(Arc::new(background_mask(image, self.tolerance))),
                AiTask::AiExtend { direction, amount, bounds } => {
                    let (target, (ox, oy)) = direction
                        .extended(bounds, amount)
                        .ok_or_else(|| AiError::Failed(format!("cannot grow {} by {}", bounds, amount)))?;
                    RasterPatch::Extension {
                        canvas: Arc::new(replicate_edges(image, target.width, target.height, ox, oy)),
                        offset_x: ox,
                        offset_y: oy,
                    }
                }
                AiTask::AiEnhance => {
                    let params = AdjustParams {
                        brightness: 0.0,
                        contrast: 0.1,
                        saturation: 0.15,
                    };
                    RasterPatch::Pixels(Arc::new(adjust_pixels(image, params)))
                }
            };
            if request.cancel.is_cancelled() {
                return Err(AiError::Cancelled);
            }
            Ok(patch)
        })
    }

    fn supports_cancellation(&self) -> bool {
        true
    }
}

fn channel_distance(a: &Rgba<u8>, b: [u8; 3]) -> u8 {
    (0..3).map(|i| a[i].abs_diff(b[i])).max().unwrap_or(0)
}

/// Mean color of the outermost ring of pixels.
fn border_color(image: &RgbaImage) -> [u8; 3] {
    let (w, h) = image.dimensions();
    let mut sum = [0u64; 3];
    let mut count = 0u64;
    for y in 0..h {
        for x in 0..w {
            if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
                let p = image.get_pixel(x, y);
                for i in 0..3 {
                    sum[i] += p[i] as u64;
                }
                count += 1;
            }
        }
    }
    let count = count.max(1);
    sum.map(|s| (s / count) as u8)
}

/// Flood fill from the border through pixels close to the border color.
/// Reached pixels are background (0), the rest foreground (255).
pub fn background_mask(image: &RgbaImage, tolerance: u8) -> GrayImage {
    let (w, h) = image.dimensions();
    let mut mask = GrayImage::from_pixel(w, h, Luma([255]));
    if w == 0 || h == 0 {
        return mask;
    }
    let seed = border_color(image);
    let mut visited = vec![false; (w * h) as usize];
    let mut queue = VecDeque::new();

    for y in 0..h {
        for x in 0..w {
            let on_border = x == 0 || y == 0 || x == w - 1 || y == h - 1;
            if on_border && channel_distance(image.get_pixel(x, y), seed) <= tolerance {
                visited[(y * w + x) as usize] = true;
                queue.push_back((x, y));
            }
        }
    }

    while let Some((x, y)) = queue.pop_front() {
        mask.put_pixel(x, y, Luma([0]));
        let neighbors = [
            (x.wrapping_sub(1), y),
            (x + 1, y),
            (x, y.wrapping_sub(1)),
            (x, y + 1),
        ];
        for (nx, ny) in neighbors {
            if nx >= w || ny >= h {
                continue;
            }
            let idx = (ny * w + nx) as usize;
            if visited[idx] {
                continue;
            }
            if channel_distance(image.get_pixel(nx, ny), seed) <= tolerance {
                visited[idx] = true;
                queue.push_back((nx, ny));
            }
        }
    }
    mask
}

/// Build a `width x height` canvas with `image` at `(ox, oy)` and every new
/// pixel copied from the nearest edge pixel.
pub fn replicate_edges(image: &RgbaImage, width: u32, height: u32, ox: u32, oy: u32) -> RgbaImage {
    let (sw, sh) = image.dimensions();
    RgbaImage::from_fn(width, height, |x, y| {
        let sx = (x as i64 - ox as i64).clamp(0, sw as i64 - 1) as u32;
        let sy = (y as i64 - oy as i64).clamp(0, sh as i64 - 1) as u32;
        *image.get_pixel(sx, sy)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{CancelToken, JobHandle};
    use crate::operation::ExtendDirection;
    use crate::raster::Geometry;
    use crate::test_util::{block_on, solid};

    fn request(task: AiTask, image: RgbaImage) -> AiRequest {
        let geometry = Geometry::new(image.width(), image.height());
        AiRequest {
            handle: JobHandle(1),
            task,
            image: Arc::new(image),
            geometry,
            cancel: CancelToken::default(),
        }
    }

    #[test]
    fn test_background_mask_keeps_subject() {
        let mut img = solid(9, 9, [250, 250, 250, 255]);
        for y in 3..6 {
            for x in 3..6 {
                img.put_pixel(x, y, Rgba([20, 30, 200, 255]));
            }
        }
        let mask = background_mask(&img, 30);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert_eq!(mask.get_pixel(4, 4)[0], 255);
        assert_eq!(mask.get_pixel(8, 4)[0], 0);
    }

    #[test]
    fn test_replicate_edges() {
        let mut img = solid(2, 1, [10, 0, 0, 255]);
        img.put_pixel(1, 0, Rgba([20, 0, 0, 255]));
        let out = replicate_edges(&img, 4, 2, 1, 0);
        assert_eq!(out.get_pixel(0, 0)[0], 10);
        assert_eq!(out.get_pixel(3, 1)[0], 20);
        assert_eq!(out.get_pixel(2, 0)[0], 20);
    }

    #[test]
    fn test_extension_patch_matches_geometry() {
        let service = LocalAiService::default();
        let task = AiTask::AiExtend {
            direction: ExtendDirection::All,
            amount: 2,
            bounds: Geometry::new(3, 3),
        };
        let patch = block_on(service.run(&request(task, solid(3, 3, [1, 1, 1, 255])))).unwrap();
        assert_eq!(patch.geometry(), Geometry::new(7, 7));
    }

    #[test]
    fn test_cancelled_request() {
        let service = LocalAiService::default();
        let req = request(AiTask::BackgroundRemove, solid(2, 2, [0, 0, 0, 255]));
        req.cancel.cancel();
        assert_eq!(block_on(service.run(&req)), Err(AiError::Cancelled));
    }
}
