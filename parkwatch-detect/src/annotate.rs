//! Renders the annotated (`*_detected.jpg`) variant of a capture:
//! each rescaled bbox outlined, labeled with the space name, state,
//! and confidence percentage.

use image::{Rgb, RgbImage};
use rusttype::{point, Font, Scale};

use crate::{state_color, state_label, DetectRegion, Error, Result, SpaceObservation};

const OUTLINE_PX: u32 = 2;
const LABEL_SCALE: f32 = 18.0;

fn load_font() -> Result<Font<'static>> {
    Font::try_from_bytes(ttf_firacode::REGULAR)
        .ok_or_else(|| Error::Inference("embedded font failed to parse".to_string()))
}

fn blend_pixel(image: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>, alpha: f32) {
    if x >= image.width() || y >= image.height() {
        return;
    }
    let old = image.get_pixel(x, y).0;
    let q = alpha.clamp(0.0, 1.0);
    let p = 1.0 - q;
    let new = [
        (old[0] as f32 * p + color.0[0] as f32 * q).round() as u8,
        (old[1] as f32 * p + color.0[1] as f32 * q).round() as u8,
        (old[2] as f32 * p + color.0[2] as f32 * q).round() as u8,
    ];
    image.put_pixel(x, y, Rgb(new));
}

fn draw_outline(image: &mut RgbImage, rect: &crate::PixelRect, color: Rgb<u8>) {
    let (w, h) = (image.width(), image.height());
    let x2 = rect.x2.min(w.saturating_sub(1));
    let y2 = rect.y2.min(h.saturating_sub(1));
    for t in 0..OUTLINE_PX {
        for x in rect.x1..=x2 {
            blend_pixel(image, x, rect.y1.saturating_add(t), color, 1.0);
            blend_pixel(image, x, y2.saturating_sub(t), color, 1.0);
        }
        for y in rect.y1..=y2 {
            blend_pixel(image, rect.x1.saturating_add(t), y, color, 1.0);
            blend_pixel(image, x2.saturating_sub(t), y, color, 1.0);
        }
    }
}

fn stamp_text(image: &mut RgbImage, font: &Font, text: &str, x0: f32, y0: f32, color: Rgb<u8>) {
    let scale = Scale::uniform(LABEL_SCALE);
    let v_metrics = font.v_metrics(scale);
    let glyphs: Vec<_> = font
        .layout(text, scale, point(x0, y0 + v_metrics.ascent))
        .collect();
    for glyph in glyphs {
        if let Some(bb) = glyph.pixel_bounding_box() {
            glyph.draw(|gx, gy, v| {
                let x = gx as i32 + bb.min.x;
                let y = gy as i32 + bb.min.y;
                if x >= 0 && y >= 0 {
                    blend_pixel(image, x as u32, y as u32, color, v);
                }
            });
        }
    }
}

fn label_for(region: &DetectRegion, obs: Option<&SpaceObservation>) -> String {
    let occupied = obs.and_then(|o| o.occupied);
    let confidence = obs.and_then(|o| o.confidence);
    match confidence {
        Some(c) => format!(
            "{} {} {:.0}%",
            region.space_name,
            state_label(occupied),
            c * 100.0
        ),
        None => format!("{} {}", region.space_name, state_label(occupied)),
    }
}

/// Draw the annotations on a copy of `frame`.
///
/// Observations are matched to regions by `space_id`; a region with no
/// observation renders as unknown.
pub fn annotate_frame(
    frame: &RgbImage,
    regions: &[DetectRegion],
    observations: &[SpaceObservation],
) -> Result<RgbImage> {
    let font = load_font()?;
    let mut out = frame.clone();
    for region in regions {
        let obs = observations.iter().find(|o| o.space_id == region.space_id);
        let color = state_color(obs.and_then(|o| o.occupied));
        draw_outline(&mut out, &region.rect, color);
        let label = label_for(region, obs);
        // Label sits just above the box, or inside when there is no
        // headroom.
        let y = if region.rect.y1 > LABEL_SCALE as u32 + 2 {
            region.rect.y1 as f32 - LABEL_SCALE - 2.0
        } else {
            region.rect.y1 as f32 + 2.0
        };
        stamp_text(&mut out, &font, &label, region.rect.x1 as f32 + 2.0, y, color);
    }
    Ok(out)
}
