//! Text layer rasterization.

use crate::operation::TextAlign;
use crate::raster::TextLayer;
use ab_glyph::{Font, FontArc, GlyphId, PxScale, ScaleFont, point};
use image::RgbaImage;

/// Embedded DejaVu Sans, used when no font is configured.
static DEJAVU_SANS: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

/// The bundled fallback font.
pub fn bundled_font() -> Option<FontArc> {
    match FontArc::try_from_slice(DEJAVU_SANS) {
        Ok(font) => Some(font),
        Err(e) => {
            log::warn!("Bundled font is invalid: {}, text will not be drawn", e);
            None
        }
    }
}

/// Advance width of one line.
fn line_width<F: Font, SF: ScaleFont<F>>(scaled: &SF, line: &str) -> f32 {
    let mut width = 0.0;
    let mut last: Option<GlyphId> = None;
    for ch in line.chars() {
        let id = scaled.glyph_id(ch);
        if let Some(prev) = last {
            width += scaled.kern(prev, id);
        }
        width += scaled.h_advance(id);
        last = Some(id);
    }
    width
}

/// Blend `color` over `dst` with the given coverage.
fn blend(dst: &mut image::Rgba<u8>, color: [u8; 4], coverage: f32) {
    let a = (color[3] as f32 / 255.0) * coverage.clamp(0.0, 1.0);
    if a <= 0.0 {
        return;
    }
    let dst_a = dst[3] as f32 / 255.0;
    for i in 0..3 {
        let v = color[i] as f32 * a + dst[i] as f32 * (1.0 - a);
        dst[i] = v.round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = ((a + dst_a * (1.0 - a)) * 255.0).round().clamp(0.0, 255.0) as u8;
}

/// Draw a text layer onto `target`. Multi-line content splits on `\n`;
/// glyphs falling outside the raster are clipped.
pub fn draw_text(target: &mut RgbaImage, font: &FontArc, layer: &TextLayer) {
    let scale = PxScale::from(layer.style.font_size);
    let scaled = font.as_scaled(scale);
    let ascent = scaled.ascent();
    let line_height = scaled.height() + scaled.line_gap();
    let (tw, th) = (target.width() as i32, target.height() as i32);

    for (line_idx, line) in layer.content.split('\n').enumerate() {
        let width = line_width(&scaled, line);
        let anchor_x = layer.position.x as f32;
        let mut caret = match layer.style.align {
            TextAlign::Left => anchor_x,
            TextAlign::Center => anchor_x - width * 0.5,
            TextAlign::Right => anchor_x - width,
        };
        let baseline = layer.position.y as f32 + ascent + line_idx as f32 * line_height;

        let mut last: Option<GlyphId> = None;
        for ch in line.chars() {
            let id = scaled.glyph_id(ch);
            if let Some(prev) = last {
                caret += scaled.kern(prev, id);
            }
            let glyph = id.with_scale_and_position(scale, point(caret, baseline));
            caret += scaled.h_advance(id);
            last = Some(id);

            let Some(outlined) = font.outline_glyph(glyph) else {
                continue;
            };
            let bounds = outlined.px_bounds();
            outlined.draw(|gx, gy, coverage| {
                let x = bounds.min.x as i32 + gx as i32;
                let y = bounds.min.y as i32 + gy as i32;
                if x >= 0 && y >= 0 && x < tw && y < th {
                    blend(target.get_pixel_mut(x as u32, y as u32), layer.style.color, coverage);
                }
            });
        }
    }
}
