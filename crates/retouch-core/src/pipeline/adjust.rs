//! Brightness, contrast and saturation.
//!
//! Channels are processed in 0..255 float space, clamped after every stage
//! so the result depends only on the parameters and never on the order the
//! sliders were moved. Alpha is untouched.

use crate::operation::AdjustParams;
use image::RgbaImage;
use rayon::prelude::*;

/// Adjust one RGB triple. `brightness` is additive, `contrast` scales around
/// mid-gray, `saturation` scales the distance from Rec. 601 luma.
pub fn adjust_rgb(rgb: [f32; 3], params: AdjustParams) -> [f32; 3] {
    let offset = params.brightness * 255.0;
    let contrast = 1.0 + params.contrast;
    let saturation = 1.0 + params.saturation;

    let mut c = rgb.map(|v| (v + offset).clamp(0.0, 255.0));
    c = c.map(|v| ((v - 128.0) * contrast + 128.0).clamp(0.0, 255.0));

    let luma = 0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2];
    c.map(|v| (luma + (v - luma) * saturation).clamp(0.0, 255.0))
}

/// Produce an adjusted copy of `src`.
pub fn adjust_pixels(src: &RgbaImage, params: AdjustParams) -> RgbaImage {
    let w = src.width() as usize;
    let h = src.height() as usize;
    if params.is_neutral() || w == 0 || h == 0 {
        return src.clone();
    }

    let stride = w * 4;
    let src_raw = src.as_raw();
    let mut dst_raw = vec![0u8; w * h * 4];

    dst_raw.par_chunks_mut(stride).enumerate().for_each(|(y, row_out)| {
        let row_in = &src_raw[y * stride..(y + 1) * stride];
        for (px_in, px_out) in row_in.chunks_exact(4).zip(row_out.chunks_exact_mut(4)) {
            let [r, g, b] = adjust_rgb([px_in[0] as f32, px_in[1] as f32, px_in[2] as f32], params);
            px_out[0] = r.round() as u8;
            px_out[1] = g.round() as u8;
            px_out[2] = b.round() as u8;
            px_out[3] = px_in[3];
        }
    });

    // Same dimensions as src, so the buffer length always matches.
    RgbaImage::from_raw(w as u32, h as u32, dst_raw).unwrap_or_else(|| src.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::solid;

    fn params(brightness: f32, contrast: f32, saturation: f32) -> AdjustParams {
        AdjustParams { brightness, contrast, saturation }
    }

    #[test]
    fn test_neutral_is_identity() {
        let img = solid(3, 3, [12, 200, 90, 128]);
        assert_eq!(adjust_pixels(&img, AdjustParams::default()), img);
    }

    #[test]
    fn test_brightness_is_additive() {
        let out = adjust_rgb([100.0, 100.0, 100.0], params(0.2, 0.0, 0.0));
        assert_eq!(out, [151.0, 151.0, 151.0]);
    }

    #[test]
    fn test_contrast_pivots_on_mid_gray() {
        let out = adjust_rgb([128.0, 64.0, 192.0], params(0.0, 1.0, 0.0));
        assert_eq!(out, [128.0, 0.0, 255.0]);
        let flat = adjust_rgb([10.0, 250.0, 90.0], params(0.0, -1.0, 0.0));
        assert_eq!(flat, [128.0, 128.0, 128.0]);
    }

    #[test]
    fn test_full_desaturation_yields_gray() {
        let [r, g, b] = adjust_rgb([255.0, 0.0, 0.0], params(0.0, 0.0, -1.0));
        assert!((r - g).abs() < 1e-3 && (g - b).abs() < 1e-3);
    }

    #[test]
    fn test_order_is_fixed() {
        // Brightness saturates before contrast sees the value.
        let out = adjust_rgb([250.0, 250.0, 250.0], params(0.5, 0.5, 0.0));
        assert_eq!(out, [255.0, 255.0, 255.0]);
    }

    #[test]
    fn test_alpha_preserved() {
        let img = solid(2, 2, [50, 60, 70, 33]);
        let out = adjust_pixels(&img, params(0.1, 0.1, 0.1));
        assert!(out.pixels().all(|p| p[3] == 33));
    }
}
