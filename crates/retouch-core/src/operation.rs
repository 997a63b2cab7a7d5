//! Edit operations and the result patches produced by AI services.

use crate::raster::Geometry;
use base64::{Engine, engine::general_purpose::STANDARD};
use image::{GrayImage, ImageFormat, RgbaImage};
use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use uuid::Uuid;

/// A crop rectangle in raster pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Normalize a drag between two points into a pixel rectangle, clamped
    /// to the raster.
    pub fn from_drag(start: Point, end: Point, bounds: Geometry) -> Self {
        let rect = Rect::from_points(start, end)
            .intersect(Rect::new(0.0, 0.0, bounds.width as f64, bounds.height as f64))
            .round();
        Self {
            x: rect.x0.max(0.0) as u32,
            y: rect.y0.max(0.0) as u32,
            width: rect.width().max(0.0) as u32,
            height: rect.height().max(0.0) as u32,
        }
    }

    /// The whole raster.
    pub fn full(bounds: Geometry) -> Self {
        Self::new(0, 0, bounds.width, bounds.height)
    }

    /// Whether the rectangle is non-empty and lies inside `bounds`.
    pub fn fits(&self, bounds: Geometry) -> bool {
        self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= bounds.width as u64
            && self.y as u64 + self.height as u64 <= bounds.height as u64
    }
}

/// Color adjustment parameters, each normalized to `[-1, 1]` with 0 neutral.
///
/// Applied in the fixed order brightness, contrast, saturation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AdjustParams {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
}

impl AdjustParams {
    pub fn is_neutral(&self) -> bool {
        self.brightness == 0.0 && self.contrast == 0.0 && self.saturation == 0.0
    }

    pub fn is_in_range(&self) -> bool {
        [self.brightness, self.contrast, self.saturation]
            .iter()
            .all(|v| v.is_finite() && (-1.0..=1.0).contains(v))
    }

    /// Set one channel, clamping into range.
    pub fn set(&mut self, channel: AdjustChannel, value: f32) {
        let value = if value.is_finite() { value.clamp(-1.0, 1.0) } else { 0.0 };
        match channel {
            AdjustChannel::Brightness => self.brightness = value,
            AdjustChannel::Contrast => self.contrast = value,
            AdjustChannel::Saturation => self.saturation = value,
        }
    }
}

/// One adjustment slider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustChannel {
    Brightness,
    Contrast,
    Saturation,
}

/// Horizontal alignment of text relative to its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

/// Appearance of a text overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStyle {
    pub font_size: f32,
    /// RGBA color.
    pub color: [u8; 4],
    pub align: TextAlign,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font_size: 32.0,
            color: [255, 255, 255, 255],
            align: TextAlign::Left,
        }
    }
}

/// Which edges an AI extension grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendDirection {
    Left,
    Right,
    Top,
    Bottom,
    All,
}

impl ExtendDirection {
    /// Geometry after growing `bounds` by `amount` pixels, and the offset at
    /// which the original content sits inside it. `None` when a dimension
    /// would overflow.
    pub fn extended(self, bounds: Geometry, amount: u32) -> Option<(Geometry, (u32, u32))> {
        let (w, h) = (bounds.width, bounds.height);
        let extended = match self {
            ExtendDirection::Left => (Geometry::new(w.checked_add(amount)?, h), (amount, 0)),
            ExtendDirection::Right => (Geometry::new(w.checked_add(amount)?, h), (0, 0)),
            ExtendDirection::Top => (Geometry::new(w, h.checked_add(amount)?), (0, amount)),
            ExtendDirection::Bottom => (Geometry::new(w, h.checked_add(amount)?), (0, 0)),
            ExtendDirection::All => {
                let both = amount.checked_mul(2)?;
                (
                    Geometry::new(w.checked_add(both)?, h.checked_add(both)?),
                    (amount, amount),
                )
            }
        };
        Some(extended)
    }
}

/// The stored outcome of an AI job, kept inside the operation log so replay
/// never calls the service again.
#[derive(Clone, PartialEq)]
pub enum RasterPatch {
    /// Alpha multiplier with the raster's geometry (background removal).
    AlphaMask(Arc<GrayImage>),
    /// Full canvas for an extension; current pixels are pasted at the offset.
    Extension {
        canvas: Arc<RgbaImage>,
        offset_x: u32,
        offset_y: u32,
    },
    /// Replacement pixels at unchanged geometry (enhancement).
    Pixels(Arc<RgbaImage>),
}

impl fmt::Debug for RasterPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterPatch::AlphaMask(mask) => write!(f, "AlphaMask({}x{})", mask.width(), mask.height()),
            RasterPatch::Extension { canvas, offset_x, offset_y } => write!(
                f,
                "Extension({}x{} @ {},{})",
                canvas.width(),
                canvas.height(),
                offset_x,
                offset_y
            ),
            RasterPatch::Pixels(pixels) => write!(f, "Pixels({}x{})", pixels.width(), pixels.height()),
        }
    }
}

impl RasterPatch {
    /// Geometry of the patch payload.
    pub fn geometry(&self) -> Geometry {
        match self {
            RasterPatch::AlphaMask(mask) => Geometry::new(mask.width(), mask.height()),
            RasterPatch::Extension { canvas, .. } => Geometry::new(canvas.width(), canvas.height()),
            RasterPatch::Pixels(pixels) => Geometry::new(pixels.width(), pixels.height()),
        }
    }
}

/// Serialized form of a patch: PNG bytes as base64.
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EncodedPatch {
    AlphaMask { png: String },
    Extension { png: String, offset_x: u32, offset_y: u32 },
    Pixels { png: String },
}

fn png_base64(image: image::DynamicImage) -> Result<String, String> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| e.to_string())?;
    Ok(STANDARD.encode(bytes))
}

fn decode_png(data: &str) -> Result<image::DynamicImage, String> {
    let bytes = STANDARD.decode(data).map_err(|e| e.to_string())?;
    image::load_from_memory_with_format(&bytes, ImageFormat::Png).map_err(|e| e.to_string())
}

impl TryFrom<&RasterPatch> for EncodedPatch {
    type Error = String;

    fn try_from(patch: &RasterPatch) -> Result<Self, Self::Error> {
        Ok(match patch {
            RasterPatch::AlphaMask(mask) => EncodedPatch::AlphaMask {
                png: png_base64(image::DynamicImage::ImageLuma8((**mask).clone()))?,
            },
            RasterPatch::Extension { canvas, offset_x, offset_y } => EncodedPatch::Extension {
                png: png_base64(image::DynamicImage::ImageRgba8((**canvas).clone()))?,
                offset_x: *offset_x,
                offset_y: *offset_y,
            },
            RasterPatch::Pixels(pixels) => EncodedPatch::Pixels {
                png: png_base64(image::DynamicImage::ImageRgba8((**pixels).clone()))?,
            },
        })
    }
}

impl TryFrom<EncodedPatch> for RasterPatch {
    type Error = String;

    fn try_from(encoded: EncodedPatch) -> Result<Self, Self::Error> {
        Ok(match encoded {
            EncodedPatch::AlphaMask { png } => RasterPatch::AlphaMask(Arc::new(decode_png(&png)?.to_luma8())),
            EncodedPatch::Extension { png, offset_x, offset_y } => RasterPatch::Extension {
                canvas: Arc::new(decode_png(&png)?.to_rgba8()),
                offset_x,
                offset_y,
            },
            EncodedPatch::Pixels { png } => RasterPatch::Pixels(Arc::new(decode_png(&png)?.to_rgba8())),
        })
    }
}

impl Serialize for RasterPatch {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        EncodedPatch::try_from(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RasterPatch {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = EncodedPatch::deserialize(deserializer)?;
        RasterPatch::try_from(encoded).map_err(serde::de::Error::custom)
    }
}

/// An immutable edit. AI variants carry their resolved patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Resize {
        width: u32,
        height: u32,
    },
    Crop(CropRect),
    Adjust(AdjustParams),
    TextOverlay {
        id: Uuid,
        content: String,
        style: TextStyle,
        position: Point,
    },
    BackgroundRemove {
        patch: RasterPatch,
    },
    AiExtend {
        direction: ExtendDirection,
        amount: u32,
        /// Geometry the extension was computed against.
        bounds: Geometry,
        patch: RasterPatch,
    },
    AiEnhance {
        patch: RasterPatch,
    },
}

impl Operation {
    /// Short kind label, as stored in `activeTransformations`.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Resize { .. } => "resize",
            Operation::Crop(_) => "crop",
            Operation::Adjust(_) => "adjust",
            Operation::TextOverlay { .. } => "text",
            Operation::BackgroundRemove { .. } => "background_remove",
            Operation::AiExtend { .. } => "ai_extend",
            Operation::AiEnhance { .. } => "ai_enhance",
        }
    }

    /// Whether this operation came from an AI job.
    pub fn is_ai(&self) -> bool {
        matches!(
            self,
            Operation::BackgroundRemove { .. } | Operation::AiExtend { .. } | Operation::AiEnhance { .. }
        )
    }

    /// Whether this operation changes raster geometry.
    pub fn changes_geometry(&self) -> bool {
        matches!(
            self,
            Operation::Resize { .. } | Operation::Crop(_) | Operation::AiExtend { .. }
        )
    }
}

/// Work delegated to an AI service. Resolves into an [`Operation`] once the
/// service returns a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum AiTask {
    BackgroundRemove,
    AiExtend {
        direction: ExtendDirection,
        amount: u32,
        bounds: Geometry,
    },
    AiEnhance,
}

impl AiTask {
    /// Message shown while the job runs.
    pub fn processing_message(&self) -> &'static str {
        match self {
            AiTask::BackgroundRemove => "Removing background...",
            AiTask::AiExtend { .. } => "Extending image with AI...",
            AiTask::AiEnhance => "Enhancing image with AI...",
        }
    }

    /// Whether the result replaces the pixels it was computed from, rather
    /// than being merged into whatever is current.
    pub fn replaces_pixels(&self) -> bool {
        matches!(self, AiTask::AiEnhance)
    }

    /// Attach the service result.
    pub fn resolve(self, patch: RasterPatch) -> Operation {
        match self {
            AiTask::BackgroundRemove => Operation::BackgroundRemove { patch },
            AiTask::AiExtend { direction, amount, bounds } => Operation::AiExtend {
                direction,
                amount,
                bounds,
                patch,
            },
            AiTask::AiEnhance => Operation::AiEnhance { patch },
        }
    }
}
