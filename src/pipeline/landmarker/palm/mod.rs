mod anchors;

use std::{cmp::Ordering, f32::consts::FRAC_PI_2, path::Path};

use anyhow::{Context, Result, anyhow, ensure};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use self::anchors::{NUM_ANCHORS, anchors};
use super::common::{Letterbox, PALM_INPUT_SIZE, RotatedCrop, letterbox_tensor};
use crate::types::Frame;

const PALM_KEYPOINTS: usize = 7;
const BOX_FEATURES: usize = 4 + PALM_KEYPOINTS * 2;
const WRIST_KEYPOINT: usize = 0;
const MIDDLE_MCP_KEYPOINT: usize = 2;

/// Palm boxes are expanded this much to cover the fingers.
const CROP_SCALE: f32 = 2.6;
/// Shift of the crop centre along the wrist→fingers direction, relative to the box size.
const CROP_SHIFT: f32 = 0.5;

#[derive(Clone, Debug)]
pub struct PalmDetectorConfig {
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub top_k: usize,
}

impl Default for PalmDetectorConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.3,
            top_k: 32,
        }
    }
}

/// A detected palm in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct PalmRegion {
    /// `[x1, y1, x2, y2]`
    pub bbox: [f32; 4],
    pub keypoints: Vec<(f32, f32)>,
    pub score: f32,
}

impl PalmRegion {
    /// The rotated square the handpose estimator should look at for this palm.
    pub fn hand_crop(&self) -> RotatedCrop {
        let [x1, y1, x2, y2] = self.bbox;
        let size = (x2 - x1).max(y2 - y1).max(1.0);
        let center = ((x1 + x2) * 0.5, (y1 + y2) * 0.5);

        let angle = match (
            self.keypoints.get(WRIST_KEYPOINT),
            self.keypoints.get(MIDDLE_MCP_KEYPOINT),
        ) {
            (Some(wrist), Some(middle)) => (middle.1 - wrist.1).atan2(middle.0 - wrist.0) + FRAC_PI_2,
            _ => 0.0,
        };

        // "Up" in the crop is the wrist→fingers direction in the frame.
        let (sin, cos) = angle.sin_cos();
        let shift = CROP_SHIFT * size;
        RotatedCrop {
            center: (center.0 + shift * sin, center.1 - shift * cos),
            side: size * CROP_SCALE,
            angle,
        }
    }
}

pub struct PalmDetector {
    session: Session,
    cfg: PalmDetectorConfig,
}

impl PalmDetector {
    pub fn new(model_path: &Path, cfg: PalmDetectorConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!("failed to load palm detector from {}", model_path.display())
            })?;

        Ok(Self { session, cfg })
    }

    /// Palms sorted by descending score.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<PalmRegion>> {
        let (input, letterbox) = letterbox_tensor(frame, PALM_INPUT_SIZE)?;
        let outputs = self
            .session
            .run(ort::inputs![Tensor::from_array(input)?])
            .context("failed to run palm detector session")?;
        ensure!(
            outputs.len() >= 2,
            "palm detector returned {} outputs, expected 2",
            outputs.len()
        );

        let boxes = outputs[0].try_extract_array::<f32>()?;
        let scores = outputs[1].try_extract_array::<f32>()?;
        let boxes: Vec<f32> = boxes.iter().copied().collect();
        let scores: Vec<f32> = scores.iter().copied().collect();

        decode_palms(&boxes, &scores, &letterbox, &self.cfg)
    }
}

/// Decodes raw SSD regressions (`[anchors, 18]`) and logits (`[anchors]`) into palms.
fn decode_palms(
    boxes: &[f32],
    scores: &[f32],
    letterbox: &Letterbox,
    cfg: &PalmDetectorConfig,
) -> Result<Vec<PalmRegion>> {
    ensure!(
        boxes.len() % BOX_FEATURES == 0,
        "palm box tensor length {} is not a multiple of {BOX_FEATURES}",
        boxes.len()
    );
    let count = boxes.len() / BOX_FEATURES;
    if count != scores.len() {
        return Err(anyhow!(
            "palm detector produced {count} boxes but {} scores",
            scores.len()
        ));
    }

    let anchors = anchors();
    let input = PALM_INPUT_SIZE as f32;
    let to_frame = |nx: f32, ny: f32| {
        (
            (nx * input - letterbox.pad_x) / letterbox.scale,
            (ny * input - letterbox.pad_y) / letterbox.scale,
        )
    };
    let max_x = letterbox.orig_w.saturating_sub(1) as f32;
    let max_y = letterbox.orig_h.saturating_sub(1) as f32;

    let mut candidates = Vec::new();
    for (idx, (raw, &logit)) in boxes
        .chunks_exact(BOX_FEATURES)
        .zip(scores)
        .take(NUM_ANCHORS)
        .enumerate()
    {
        let score = sigmoid(logit);
        if score < cfg.score_threshold {
            continue;
        }
        let [ax, ay] = anchors[idx];

        let cx = raw[0] / input + ax;
        let cy = raw[1] / input + ay;
        let (hw, hh) = (raw[2] / input / 2.0, raw[3] / input / 2.0);
        let (x1, y1) = to_frame(cx - hw, cy - hh);
        let (x2, y2) = to_frame(cx + hw, cy + hh);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let keypoints = raw[4..]
            .chunks_exact(2)
            .map(|kp| to_frame(kp[0] / input + ax, kp[1] / input + ay))
            .collect();

        candidates.push(PalmRegion {
            bbox: [
                x1.clamp(0.0, max_x),
                y1.clamp(0.0, max_y),
                x2.clamp(0.0, max_x),
                y2.clamp(0.0, max_y),
            ],
            keypoints,
            score,
        });
    }

    Ok(non_max_suppression(candidates, cfg.nms_threshold, cfg.top_k))
}

fn non_max_suppression(
    mut candidates: Vec<PalmRegion>,
    threshold: f32,
    top_k: usize,
) -> Vec<PalmRegion> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<PalmRegion> = Vec::new();
    for candidate in candidates {
        if kept.len() >= top_k {
            break;
        }
        if kept
            .iter()
            .all(|k| iou(&k.bbox, &candidate.bbox) < threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    if inter <= 0.0 {
        return 0.0;
    }

    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
