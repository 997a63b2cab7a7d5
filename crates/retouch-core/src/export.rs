//! Image export.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

/// Export errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExportError {
    #[error("Failed to encode {format}: {message}")]
    Encode { format: &'static str, message: String },
}

/// Output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum ExportFormat {
    Png,
    /// Quality in 1..=100.
    Jpeg { quality: u8 },
    /// Lossless; the encoder has no quality setting.
    WebP,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg { .. } => "jpg",
            ExportFormat::WebP => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Png => "image/png",
            ExportFormat::Jpeg { .. } => "image/jpeg",
            ExportFormat::WebP => "image/webp",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ExportFormat::Png => "PNG",
            ExportFormat::Jpeg { .. } => "JPEG",
            ExportFormat::WebP => "WebP",
        }
    }

    /// Encode `image`. JPEG drops the alpha channel.
    pub fn encode(&self, image: &RgbaImage) -> Result<Vec<u8>, ExportError> {
        let err = |e: image::ImageError| ExportError::Encode {
            format: self.name(),
            message: e.to_string(),
        };
        let mut bytes = Vec::new();
        let mut cursor = Cursor::new(&mut bytes);
        match *self {
            ExportFormat::Png => image.write_to(&mut cursor, ImageFormat::Png).map_err(err)?,
            ExportFormat::Jpeg { quality } => {
                let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
                let encoder = JpegEncoder::new_with_quality(&mut cursor, quality.clamp(1, 100));
                rgb.write_with_encoder(encoder).map_err(err)?;
            }
            ExportFormat::WebP => image.write_to(&mut cursor, ImageFormat::WebP).map_err(err)?,
        }
        Ok(bytes)
    }
}

/// A named export choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportPreset {
    pub label: &'static str,
    pub format: ExportFormat,
}

/// The export menu, in display order.
pub const EXPORT_PRESETS: [ExportPreset; 4] = [
    ExportPreset {
        label: "PNG (High Quality)",
        format: ExportFormat::Png,
    },
    ExportPreset {
        label: "JPEG (90% Quality)",
        format: ExportFormat::Jpeg { quality: 90 },
    },
    ExportPreset {
        label: "JPEG (80% Quality)",
        format: ExportFormat::Jpeg { quality: 80 },
    },
    ExportPreset {
        label: "WebP (Lossless)",
        format: ExportFormat::WebP,
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::gradient;

    #[test]
    fn test_presets_encode_decodable_images() {
        let image = gradient(32, 16);
        for preset in EXPORT_PRESETS {
            let bytes = preset.format.encode(&image).unwrap();
            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (32, 16), "{}", preset.label);
        }
    }

    #[test]
    fn test_png_export_is_lossless() {
        let image = gradient(8, 8);
        let bytes = ExportFormat::Png.encode(&image).unwrap();
        assert_eq!(image::load_from_memory(&bytes).unwrap().to_rgba8(), image);
    }

    #[test]
    fn test_webp_export_is_lossless() {
        let image = gradient(8, 8);
        let bytes = ExportFormat::WebP.encode(&image).unwrap();
        assert_eq!(image::load_from_memory(&bytes).unwrap().to_rgba8(), image);
        assert_eq!(EXPORT_PRESETS[3].label, "WebP (Lossless)");
    }

    #[test]
    fn test_lower_jpeg_quality_is_smaller() {
        let image = gradient(128, 128);
        let high = ExportFormat::Jpeg { quality: 90 }.encode(&image).unwrap();
        let low = ExportFormat::Jpeg { quality: 10 }.encode(&image).unwrap();
        assert!(low.len() < high.len());
        assert_eq!(ExportFormat::Jpeg { quality: 90 }.extension(), "jpg");
    }
}
