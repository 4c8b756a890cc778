//! Scripted detectors for pipeline tests.

use std::collections::VecDeque;

use image::RgbImage;
use parking_lot::Mutex;

use crate::{DetectRegion, Detector, Error, Result, SpaceObservation};

/// Returns the same occupancy for every region on every call.
pub struct UniformDetector {
    pub occupied: Option<bool>,
    pub confidence: Option<f64>,
}

impl Detector for UniformDetector {
    fn detect(&self, _frame: &RgbImage, regions: &[DetectRegion]) -> Result<Vec<SpaceObservation>> {
        Ok(regions
            .iter()
            .map(|r| SpaceObservation {
                space_id: r.space_id.clone(),
                occupied: self.occupied,
                confidence: self.confidence,
            })
            .collect())
    }
}

/// One scripted answer per call, consumed in order. Each answer maps
/// `space_id -> (occupied, confidence)`; regions missing from the map
/// come back unknown. `Err` entries simulate a throwing detector.
pub struct ScriptedDetector {
    script: Mutex<VecDeque<ScriptedDetection>>,
}

pub enum ScriptedDetection {
    States(Vec<(String, Option<bool>, Option<f64>)>),
    Fail(String),
}

impl ScriptedDetector {
    pub fn new(script: Vec<ScriptedDetection>) -> Self {
        ScriptedDetector {
            script: Mutex::new(script.into()),
        }
    }
}

impl Detector for ScriptedDetector {
    fn detect(&self, _frame: &RgbImage, regions: &[DetectRegion]) -> Result<Vec<SpaceObservation>> {
        let next = self.script.lock().pop_front();
        match next {
            None => Ok(regions
                .iter()
                .map(|r| SpaceObservation {
                    space_id: r.space_id.clone(),
                    occupied: None,
                    confidence: None,
                })
                .collect()),
            Some(ScriptedDetection::Fail(msg)) => Err(Error::Inference(msg)),
            Some(ScriptedDetection::States(states)) => Ok(regions
                .iter()
                .map(|r| {
                    let hit = states.iter().find(|(id, _, _)| *id == r.space_id);
                    SpaceObservation {
                        space_id: r.space_id.clone(),
                        occupied: hit.and_then(|(_, o, _)| *o),
                        confidence: hit.and_then(|(_, _, c)| *c),
                    }
                })
                .collect()),
        }
    }
}
