//! Raster store: the base image, the derived pixels and their geometry.
//!
//! The base image is decoded once and never touched again. Every edit
//! produces a new [`RasterState`] that shares the base through an `Arc` and
//! carries its own derived pixel buffer, so snapshots are cheap to clone and
//! safe to hand out while the pipeline computes the next state.

use crate::config::SessionConfig;
use crate::operation::TextStyle;
use crate::storage::ImageSource;
use ab_glyph::FontArc;
use image::{ImageFormat as CodecFormat, ImageReader, RgbaImage};
use kurbo::Point;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while loading the base image.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Project {0} has no source image")]
    NoSource(String),
    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("Source is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("Unsupported image format")]
    UnsupportedFormat,
    #[error("Image is {width}x{height}, exceeding the {max} pixel budget")]
    PixelBudget { width: u32, height: u32, max: u64 },
    #[error("Image has no pixels")]
    Empty,
    #[error("Failed to decode image: {0}")]
    Decode(String),
}

/// Accepted source encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    Png,
    Jpeg,
    WebP,
    Gif,
}

impl SourceFormat {
    /// MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            SourceFormat::Png => "image/png",
            SourceFormat::Jpeg => "image/jpeg",
            SourceFormat::WebP => "image/webp",
            SourceFormat::Gif => "image/gif",
        }
    }

    /// Detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(SourceFormat::Png),
            "jpg" | "jpeg" => Some(SourceFormat::Jpeg),
            "webp" => Some(SourceFormat::WebP),
            "gif" => Some(SourceFormat::Gif),
            _ => None,
        }
    }

    /// Detect format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
            return Some(SourceFormat::Png);
        }
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(SourceFormat::Jpeg);
        }
        if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            return Some(SourceFormat::WebP);
        }
        if data.starts_with(b"GIF8") {
            return Some(SourceFormat::Gif);
        }
        None
    }

    fn codec(self) -> CodecFormat {
        match self {
            SourceFormat::Png => CodecFormat::Png,
            SourceFormat::Jpeg => CodecFormat::Jpeg,
            SourceFormat::WebP => CodecFormat::WebP,
            SourceFormat::Gif => CodecFormat::Gif,
        }
    }
}

/// Width and height of a raster, both positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The decoded source image. Immutable once loaded.
#[derive(PartialEq)]
pub struct BaseImage {
    /// Where the image was loaded from.
    pub source_url: String,
    /// Decoded pixels.
    pub pixels: Arc<RgbaImage>,
}

impl fmt::Debug for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseImage")
            .field("source_url", &self.source_url)
            .field("width", &self.pixels.width())
            .field("height", &self.pixels.height())
            .finish()
    }
}

/// A text overlay kept as a vector layer above the pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLayer {
    pub id: Uuid,
    pub content: String,
    pub style: TextStyle,
    /// Top-left anchor in raster coordinates.
    pub position: Point,
}

/// A layer stacked above the derived pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layer {
    Text(TextLayer),
}

impl Layer {
    /// Layer identifier.
    pub fn id(&self) -> Uuid {
        match self {
            Layer::Text(text) => text.id,
        }
    }

    /// Scale layer geometry after a resize.
    pub(crate) fn scale(&mut self, sx: f64, sy: f64) {
        match self {
            Layer::Text(text) => {
                text.position = Point::new(text.position.x * sx, text.position.y * sy);
                text.style.font_size = (text.style.font_size as f64 * sy).max(1.0) as f32;
            }
        }
    }

    /// Shift layer geometry after a crop or extension.
    pub(crate) fn translate(&mut self, dx: f64, dy: f64) {
        match self {
            Layer::Text(text) => {
                text.position = Point::new(text.position.x + dx, text.position.y + dy);
            }
        }
    }
}

/// One editing snapshot: derived pixels, geometry and layer stack.
#[derive(Clone, PartialEq)]
pub struct RasterState {
    base: Arc<BaseImage>,
    pixels: Arc<RgbaImage>,
    layers: Vec<Layer>,
}

impl fmt::Debug for RasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterState")
            .field("geometry", &self.geometry())
            .field("base", &self.base.source_url)
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl RasterState {
    /// Build the initial state from a decoded base image.
    pub fn from_base(source_url: impl Into<String>, pixels: RgbaImage) -> Result<Self, LoadError> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(LoadError::Empty);
        }
        let pixels = Arc::new(pixels);
        let base = Arc::new(BaseImage {
            source_url: source_url.into(),
            pixels: pixels.clone(),
        });
        Ok(Self {
            base,
            pixels,
            layers: Vec::new(),
        })
    }

    /// The state of the untouched base image.
    pub fn pristine(&self) -> Self {
        Self {
            base: self.base.clone(),
            pixels: self.base.pixels.clone(),
            layers: Vec::new(),
        }
    }

    /// Derive a new state sharing this one's base. Callers guarantee the
    /// buffer has positive dimensions.
    pub(crate) fn derive(&self, pixels: RgbaImage, layers: Vec<Layer>) -> Self {
        debug_assert!(pixels.width() > 0 && pixels.height() > 0);
        Self {
            base: self.base.clone(),
            pixels: Arc::new(pixels),
            layers,
        }
    }

    /// Derive a new state with the same pixels and a different layer stack.
    pub(crate) fn with_layers(&self, layers: Vec<Layer>) -> Self {
        Self {
            base: self.base.clone(),
            pixels: self.pixels.clone(),
            layers,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width(), self.height())
    }

    pub fn base(&self) -> &BaseImage {
        &self.base
    }

    pub fn pixels(&self) -> &Arc<RgbaImage> {
        &self.pixels
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Flatten layers onto the pixels. Text layers are skipped when no font
    /// is available.
    pub fn compose(&self, font: Option<&FontArc>) -> RgbaImage {
        let mut out = (*self.pixels).clone();
        for layer in &self.layers {
            match (layer, font) {
                (Layer::Text(text), Some(font)) => crate::pipeline::text::draw_text(&mut out, font, text),
                (Layer::Text(text), None) => {
                    log::warn!("No font available, text layer {} not drawn", text.id);
                }
            }
        }
        out
    }

    /// Composed thumbnail whose longest edge is at most `max_edge`.
    pub fn thumbnail(&self, max_edge: u32, font: Option<&FontArc>) -> RgbaImage {
        let composed = self.compose(font);
        let (w, h) = fit_within(self.width(), self.height(), max_edge);
        if (w, h) == (self.width(), self.height()) {
            return composed;
        }
        image::imageops::thumbnail(&composed, w, h)
    }
}

/// Scale `(width, height)` so the longest edge is at most `max_edge`.
pub fn fit_within(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_edge {
        return (width, height);
    }
    let scale = max_edge as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Limits applied when decoding a source image.
#[derive(Debug, Clone, Copy)]
pub struct SourceLimits {
    pub max_bytes: usize,
    pub max_pixels: u64,
}

impl From<&SessionConfig> for SourceLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_bytes: config.max_source_bytes,
            max_pixels: config.max_pixels,
        }
    }
}

/// Decode encoded bytes into an initial state, enforcing the limits.
///
/// Dimensions are read from the header first so oversized images are rejected
/// before any pixel buffer is allocated.
pub fn decode_source(
    source_url: &str,
    bytes: &[u8],
    limits: SourceLimits,
) -> Result<RasterState, LoadError> {
    if bytes.len() > limits.max_bytes {
        return Err(LoadError::TooLarge {
            size: bytes.len(),
            max: limits.max_bytes,
        });
    }
    let format = SourceFormat::from_magic_bytes(bytes).ok_or(LoadError::UnsupportedFormat)?;

    let mut reader = ImageReader::new(Cursor::new(bytes));
    reader.set_format(format.codec());
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| LoadError::Decode(e.to_string()))?;
    if width == 0 || height == 0 {
        return Err(LoadError::Empty);
    }
    if Geometry::new(width, height).pixel_count() > limits.max_pixels {
        return Err(LoadError::PixelBudget {
            width,
            height,
            max: limits.max_pixels,
        });
    }

    let decoded = image::load_from_memory_with_format(bytes, format.codec())
        .map_err(|e| LoadError::Decode(e.to_string()))?;
    RasterState::from_base(source_url, decoded.to_rgba8())
}

/// Owns the current raster state. Only the pipeline commits to it.
#[derive(Debug, Clone)]
pub struct RasterStore {
    current: RasterState,
}

impl RasterStore {
    /// Fetch and decode the base image.
    pub async fn load(
        source_url: &str,
        source: &dyn ImageSource,
        limits: SourceLimits,
    ) -> Result<Self, LoadError> {
        let bytes = source.fetch(source_url).await?;
        let state = decode_source(source_url, &bytes, limits)?;
        log::info!("Loaded {} ({})", source_url, state.geometry());
        Ok(Self { current: state })
    }

    /// Wrap an already-built state.
    pub fn from_state(state: RasterState) -> Self {
        Self { current: state }
    }

    /// Snapshot of the current state.
    pub fn current(&self) -> RasterState {
        self.current.clone()
    }

    /// Borrow the current state.
    pub fn current_ref(&self) -> &RasterState {
        &self.current
    }

    /// Replace the current state with a fully computed one.
    pub(crate) fn commit(&mut self, state: RasterState) {
        self.current = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAssets;
    use crate::test_util::{block_on, encode_png, solid};

    fn limits() -> SourceLimits {
        SourceLimits {
            max_bytes: 1024 * 1024,
            max_pixels: 1_000_000,
        }
    }

    #[test]
    fn test_decode_png() {
        let bytes = encode_png(&solid(8, 6, [10, 20, 30, 255]));
        let state = decode_source("mem://a.png", &bytes, limits()).unwrap();
        assert_eq!(state.geometry(), Geometry::new(8, 6));
        assert_eq!(state.base().source_url, "mem://a.png");
        assert!(state.layers().is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_format() {
        let result = decode_source("mem://a.bin", b"not an image at all", limits());
        assert!(matches!(result, Err(LoadError::UnsupportedFormat)));
    }

    #[test]
    fn test_decode_rejects_pixel_budget() {
        let bytes = encode_png(&solid(100, 100, [0, 0, 0, 255]));
        let tight = SourceLimits {
            max_bytes: 1024 * 1024,
            max_pixels: 9_999,
        };
        let result = decode_source("mem://big.png", &bytes, tight);
        assert!(matches!(result, Err(LoadError::PixelBudget { width: 100, height: 100, .. })));
    }

    #[test]
    fn test_decode_rejects_byte_budget() {
        let bytes = encode_png(&solid(16, 16, [0, 0, 0, 255]));
        let tight = SourceLimits {
            max_bytes: 8,
            max_pixels: 1_000_000,
        };
        assert!(matches!(
            decode_source("mem://a.png", &bytes, tight),
            Err(LoadError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_store_load_from_source() {
        let assets = MemoryAssets::new();
        assets.insert("mem://photo.png", encode_png(&solid(4, 4, [1, 2, 3, 255])));

        let store = block_on(RasterStore::load("mem://photo.png", &assets, limits())).unwrap();
        assert_eq!(store.current().geometry(), Geometry::new(4, 4));

        let missing = block_on(RasterStore::load("mem://nope.png", &assets, limits()));
        assert!(matches!(missing, Err(LoadError::Fetch { .. })));
    }

    #[test]
    fn test_derived_state_shares_base() {
        let state = RasterState::from_base("mem://a.png", solid(4, 4, [0, 0, 0, 255])).unwrap();
        let derived = state.derive(solid(2, 2, [9, 9, 9, 255]), Vec::new());

        assert_eq!(derived.geometry(), Geometry::new(2, 2));
        assert_eq!(derived.base().pixels.width(), 4);
        assert_eq!(derived.pristine(), state);
    }

    #[test]
    fn test_empty_base_rejected() {
        let result = RasterState::from_base("mem://empty.png", RgbaImage::new(0, 0));
        assert!(matches!(result, Err(LoadError::Empty)));
    }

    #[test]
    fn test_fit_within() {
        assert_eq!(fit_within(800, 600, 300), (300, 225));
        assert_eq!(fit_within(100, 50, 300), (100, 50));
        assert_eq!(fit_within(1000, 1, 10), (10, 1));
    }

    #[test]
    fn test_thumbnail_bounded() {
        let state = RasterState::from_base("mem://a.png", solid(40, 20, [5, 5, 5, 255])).unwrap();
        let thumb = state.thumbnail(10, None);
        assert_eq!((thumb.width(), thumb.height()), (10, 5));
    }

    #[test]
    fn test_source_format_detection() {
        assert_eq!(SourceFormat::from_extension("JPG"), Some(SourceFormat::Jpeg));
        assert_eq!(SourceFormat::from_magic_bytes(b"GIF89a.."), Some(SourceFormat::Gif));
        assert_eq!(SourceFormat::from_magic_bytes(b"xx"), None);
    }
}
