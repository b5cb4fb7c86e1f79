use std::time::Duration;

use anyhow::{Context, Result, ensure};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    HandLandmarker, LandmarkerFactory,
    common::{HANDPOSE_INPUT_SIZE, RotatedCrop},
    palm::{PalmDetector, PalmDetectorConfig},
};
use crate::{
    error::TrackerError,
    model_download::{HANDPOSE_ESTIMATOR, ModelPaths, PALM_DETECTOR, ensure_model_ready},
    types::{
        DetectionResult, Frame, HandLabel, HandObservation, Handedness, NUM_LANDMARKS,
        OperatingMode,
    },
};

/// Hands whose presence score falls below this are dropped.
const MIN_HAND_PRESENCE: f32 = 0.5;
/// Crop size around tracked landmarks, relative to their extent.
const TRACKING_CROP_SCALE: f32 = 2.0;
const WRIST: usize = 0;
const MIDDLE_MCP: usize = 9;

/// Builds palm-detector + handpose-estimator landmarkers on ONNX Runtime.
#[derive(Clone, Debug, Default)]
pub struct OrtLandmarkerFactory {
    paths: ModelPaths,
    palm_config: PalmDetectorConfig,
}

impl OrtLandmarkerFactory {
    pub fn new(paths: ModelPaths) -> Self {
        Self {
            paths,
            palm_config: PalmDetectorConfig::default(),
        }
    }

    fn build(&self, mode: OperatingMode, max_hands: usize) -> Result<OrtLandmarker> {
        ensure_model_ready(&HANDPOSE_ESTIMATOR, &self.paths.handpose)?;
        ensure_model_ready(&PALM_DETECTOR, &self.paths.palm_detector)?;

        let handpose = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(&self.paths.handpose)
            .with_context(|| {
                format!(
                    "failed to load handpose estimator from {}",
                    self.paths.handpose.display()
                )
            })?;
        let palm_detector = PalmDetector::new(&self.paths.palm_detector, self.palm_config.clone())?;

        Ok(OrtLandmarker {
            mode,
            max_hands,
            handpose,
            palm_detector,
            tracked: Vec::new(),
        })
    }
}

impl LandmarkerFactory for OrtLandmarkerFactory {
    fn create(
        &mut self,
        mode: OperatingMode,
        max_hands: usize,
    ) -> Result<Box<dyn HandLandmarker>, TrackerError> {
        let landmarker = self
            .build(mode, max_hands)
            .map_err(TrackerError::ModelUnavailable)?;
        log::info!(
            "ORT landmarker ready using {} and {}",
            self.paths.handpose.display(),
            self.paths.palm_detector.display()
        );
        Ok(Box::new(landmarker))
    }
}

struct OrtLandmarker {
    mode: OperatingMode,
    max_hands: usize,
    handpose: Session,
    palm_detector: PalmDetector,
    /// Crops derived from the previous frame's hands (stream mode only).
    tracked: Vec<RotatedCrop>,
}

struct Estimate {
    /// Landmarks in frame pixels, z scaled like x.
    points: Vec<[f32; 3]>,
    presence: f32,
    right_score: f32,
}

impl OrtLandmarker {
    fn crops_for(&mut self, frame: &Frame) -> Result<Vec<RotatedCrop>> {
        if self.mode == OperatingMode::Stream && self.tracked.len() >= self.max_hands {
            return Ok(std::mem::take(&mut self.tracked));
        }
        self.tracked.clear();

        let palms = self.palm_detector.detect(frame)?;
        Ok(palms
            .iter()
            .take(self.max_hands)
            .map(|palm| palm.hand_crop())
            .collect())
    }

    fn estimate(&mut self, frame: &Frame, crop: &RotatedCrop) -> Result<Estimate> {
        let input = crop.sample(frame, HANDPOSE_INPUT_SIZE)?;
        let outputs = self
            .handpose
            .run(ort::inputs![Tensor::from_array(input)?])
            .context("failed to run handpose estimator")?;
        ensure!(outputs.len() > 0, "handpose estimator returned no outputs");

        let coords: Vec<f32> = outputs[0].try_extract_array::<f32>()?.iter().copied().collect();
        ensure!(
            coords.len() >= NUM_LANDMARKS * 3,
            "handpose estimator returned {} coordinates, need {}",
            coords.len(),
            NUM_LANDMARKS * 3
        );
        let scalar = |idx: usize| -> f32 {
            if outputs.len() <= idx {
                return 0.0;
            }
            outputs[idx]
                .try_extract_array::<f32>()
                .ok()
                .and_then(|arr| arr.iter().next().copied())
                .unwrap_or(0.0)
        };

        let depth_scale = crop.side / HANDPOSE_INPUT_SIZE as f32;
        let points = coords
            .chunks_exact(3)
            .take(NUM_LANDMARKS)
            .map(|p| {
                let (x, y) = crop.to_frame(p[0], p[1], HANDPOSE_INPUT_SIZE);
                [x, y, p[2] * depth_scale]
            })
            .collect();

        Ok(Estimate {
            points,
            presence: scalar(1),
            right_score: scalar(2),
        })
    }
}

impl HandLandmarker for OrtLandmarker {
    fn detect(
        &mut self,
        frame: &Frame,
        _timestamp: Option<Duration>,
    ) -> Result<DetectionResult, TrackerError> {
        let crops = self.crops_for(frame).map_err(TrackerError::Detection)?;

        let mut hands = Vec::with_capacity(crops.len());
        let mut next_tracked = Vec::with_capacity(crops.len());
        for crop in &crops {
            let estimate = self.estimate(frame, crop).map_err(TrackerError::Detection)?;
            if estimate.presence < MIN_HAND_PRESENCE {
                continue;
            }

            next_tracked.push(crop_around(&estimate.points));
            let normalized = normalize_points(&estimate.points, frame.width, frame.height);
            hands.push(HandObservation::from_points(
                &normalized,
                label_from_score(estimate.right_score),
            )?);
        }

        if self.mode == OperatingMode::Stream {
            self.tracked = next_tracked;
        }
        Ok(DetectionResult { hands })
    }

    fn reset_tracking(&mut self) {
        self.tracked.clear();
    }
}

fn label_from_score(right_score: f32) -> HandLabel {
    let score = right_score.clamp(0.0, 1.0);
    if score >= 0.5 {
        HandLabel::new(Handedness::Right, score)
    } else {
        HandLabel::new(Handedness::Left, 1.0 - score)
    }
}

/// Frame pixels to `[0, 1]` image space; z uses the width scale, like x.
fn normalize_points(points: &[[f32; 3]], width: u32, height: u32) -> Vec<[f32; 3]> {
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    points
        .iter()
        .map(|[x, y, z]| [x / w, y / h, z / w])
        .collect()
}

/// Next-frame crop covering the hand, rotated so the fingers point up.
fn crop_around(points: &[[f32; 3]]) -> RotatedCrop {
    let (min_x, max_x, min_y, max_y) = points.iter().fold(
        (f32::MAX, f32::MIN, f32::MAX, f32::MIN),
        |(lx, hx, ly, hy), p| (lx.min(p[0]), hx.max(p[0]), ly.min(p[1]), hy.max(p[1])),
    );
    let angle = match (points.get(WRIST), points.get(MIDDLE_MCP)) {
        (Some(w), Some(m)) => (m[1] - w[1]).atan2(m[0] - w[0]) + std::f32::consts::FRAC_PI_2,
        _ => 0.0,
    };

    RotatedCrop {
        center: ((min_x + max_x) * 0.5, (min_y + max_y) * 0.5),
        side: (max_x - min_x).max(max_y - min_y).max(1.0) * TRACKING_CROP_SCALE,
        angle,
    }
}
