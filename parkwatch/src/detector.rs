//! Detector backends for the binary.
//!
//! The vision model itself runs out of process; [HttpDetector] posts
//! the frame to an inference endpoint and maps its JSON answer onto
//! the per-space contract. Deployments without a model configured get
//! [DisabledDetector], which marks every space unknown so the rest of
//! the pipeline (snapshots, change rows, the UI) still works.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::warn;

use parkwatch_detect::{encode_jpeg, DetectRegion, Detector, Error, Result, SpaceObservation};

pub struct DisabledDetector;

impl Detector for DisabledDetector {
    fn detect(&self, _frame: &RgbImage, regions: &[DetectRegion]) -> Result<Vec<SpaceObservation>> {
        Ok(regions
            .iter()
            .map(|r| SpaceObservation {
                space_id: r.space_id.clone(),
                occupied: None,
                confidence: None,
            })
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct WireRegion<'a> {
    space_id: &'a str,
    bbox: [u32; 4],
}

#[derive(Debug, Deserialize)]
struct WireObservation {
    space_id: String,
    occupied: Option<bool>,
    confidence: Option<f64>,
}

/// Talks to an HTTP inference service. The frame rides as raw JPEG
/// bytes in the request body; the regions go in a JSON request header
/// so the image does not need base64 wrapping.
pub struct HttpDetector {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpDetector {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        HttpDetector { endpoint, client }
    }
}

impl Detector for HttpDetector {
    fn detect(&self, frame: &RgbImage, regions: &[DetectRegion]) -> Result<Vec<SpaceObservation>> {
        let wire_regions: Vec<WireRegion> = regions
            .iter()
            .map(|r| WireRegion {
                space_id: &r.space_id,
                bbox: [r.rect.x1, r.rect.y1, r.rect.x2, r.rect.y2],
            })
            .collect();
        let regions_json = serde_json::to_string(&wire_regions)
            .map_err(|e| Error::Inference(format!("region serialization: {e}")))?;
        let jpeg = encode_jpeg(frame)?;

        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "image/jpeg")
            .header("x-parkwatch-regions", regions_json)
            .body(jpeg)
            .send()
            .map_err(|e| Error::Inference(format!("inference request: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Inference(format!(
                "inference endpoint returned {}",
                response.status()
            )));
        }
        let answers: Vec<WireObservation> = response
            .json()
            .map_err(|e| Error::Inference(format!("inference response: {e}")))?;

        // Answers are matched by space id; anything the service did
        // not mention comes back unknown.
        Ok(regions
            .iter()
            .map(|r| {
                let hit = answers.iter().find(|a| a.space_id == r.space_id);
                if hit.is_none() {
                    warn!(space_id = %r.space_id, "inference answer missing a region");
                }
                SpaceObservation {
                    space_id: r.space_id.clone(),
                    occupied: hit.and_then(|a| a.occupied),
                    confidence: hit.and_then(|a| a.confidence),
                }
            })
            .collect())
    }
}
