//! The detector seam and the frame annotation it feeds.
//!
//! Parking-space bboxes are configured in the fixed 1920x1080 reference
//! frame; [regions_for_frame] rescales them to the captured frame's
//! actual dimensions before inference. The pipeline stores whatever the
//! detector returns, verbatim; thresholding is the detector's business.

use image::{Rgb, RgbImage};

use parkwatch_types::{ParkingSpace, REFERENCE_HEIGHT, REFERENCE_WIDTH};

pub mod annotate;
pub mod testing;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A space's bbox rescaled into actual frame pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

/// One space as handed to the detector: identity plus the rescaled
/// rect.
#[derive(Debug, Clone)]
pub struct DetectRegion {
    pub space_id: String,
    pub space_name: String,
    pub rect: PixelRect,
}

/// Detector output for one region, stored verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceObservation {
    pub space_id: String,
    /// `None` when no object crossed the detector's IoU floor.
    pub occupied: Option<bool>,
    /// In `[0, 1]`; `None` when occupancy is unknown.
    pub confidence: Option<f64>,
}

/// Maps one frame plus its regions to per-region observations.
///
/// Implementations must be re-entrant or do their own serialization;
/// the engine calls this from blocking worker threads.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &RgbImage, regions: &[DetectRegion]) -> Result<Vec<SpaceObservation>>;
}

/// Rescale a reference-frame coordinate to a frame of width/height
/// `actual` along the axis with reference size `reference`.
fn rescale(v: u32, actual: u32, reference: u32) -> u32 {
    ((v as f64) * (actual as f64) / (reference as f64)).round() as u32
}

/// Rescale the configured spaces into `w x h` frame pixels, preserving
/// order.
pub fn regions_for_frame(spaces: &[ParkingSpace], w: u32, h: u32) -> Vec<DetectRegion> {
    spaces
        .iter()
        .map(|s| DetectRegion {
            space_id: s.space_id.clone(),
            space_name: s.space_name.clone(),
            rect: PixelRect {
                x1: rescale(s.bbox.x1, w, REFERENCE_WIDTH),
                y1: rescale(s.bbox.y1, h, REFERENCE_HEIGHT),
                x2: rescale(s.bbox.x2, w, REFERENCE_WIDTH).min(w),
                y2: rescale(s.bbox.y2, h, REFERENCE_HEIGHT).min(h),
            },
        })
        .collect()
}

/// Encode a frame as JPEG for the blob store.
pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 85);
    frame.write_with_encoder(encoder)?;
    Ok(buf)
}

pub(crate) fn state_color(occupied: Option<bool>) -> Rgb<u8> {
    match occupied {
        Some(true) => Rgb([220, 40, 40]),
        Some(false) => Rgb([40, 200, 80]),
        None => Rgb([160, 160, 160]),
    }
}

pub(crate) fn state_label(occupied: Option<bool>) -> &'static str {
    match occupied {
        Some(true) => "occupied",
        Some(false) => "vacant",
        None => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkwatch_types::BBox;

    fn space(id: &str, x1: i64, y1: i64, x2: i64, y2: i64) -> ParkingSpace {
        ParkingSpace {
            space_id: id.into(),
            space_name: format!("{id}-name"),
            bbox: BBox::validated(x1, y1, x2, y2).unwrap(),
        }
    }

    #[test]
    fn rescale_identity_at_reference_size() {
        let regions = regions_for_frame(&[space("A", 10, 20, 110, 220)], 1920, 1080);
        assert_eq!(
            regions[0].rect,
            PixelRect {
                x1: 10,
                y1: 20,
                x2: 110,
                y2: 220
            }
        );
    }

    #[test]
    fn rescale_to_smaller_frame_rounds() {
        // 1920 -> 640 is a factor of 3; 1080 -> 360 likewise.
        let regions = regions_for_frame(&[space("A", 10, 20, 110, 220)], 640, 360);
        let r = &regions[0].rect;
        assert_eq!((r.x1, r.y1, r.x2, r.y2), (3, 7, 37, 73));
    }

    #[test]
    fn rescale_clamps_to_frame_edge() {
        let regions = regions_for_frame(&[space("A", 1900, 1060, 1920, 1080)], 333, 333);
        let r = &regions[0].rect;
        assert!(r.x2 <= 333 && r.y2 <= 333);
        assert!(r.x1 < r.x2 && r.y1 < r.y2);
    }

    #[test]
    fn jpeg_encode_produces_magic_bytes() {
        let frame = RgbImage::from_pixel(32, 32, Rgb([10, 10, 10]));
        let bytes = encode_jpeg(&frame).unwrap();
        assert_eq!(&bytes[..2], &[0xff, 0xd8]);
    }
}
