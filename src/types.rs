use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::TrackerError;

/// Number of keypoints the landmark model reports per hand.
pub const NUM_LANDMARKS: usize = 21;

/// Upper bound on hands reported for a single frame.
pub const MAX_HANDS: usize = 2;

/// One decoded RGBA frame, either pulled from a live capture or loaded from a still image.
#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp, measured from the start of the capture stream.
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32, timestamp: Duration) -> Self {
        Self {
            rgba,
            width,
            height,
            timestamp,
        }
    }
}

/// A 3D keypoint in normalized image space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Landmark {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl From<[f32; 3]> for Landmark {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self { x, y, z }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handedness {
    Left,
    Right,
}

impl Handedness {
    /// The opposite hand. The landmark model labels hands as if it saw a selfie view, while
    /// frames reach it unmirrored, so raw labels are reported this way.
    pub fn mirrored(self) -> Self {
        match self {
            Handedness::Left => Handedness::Right,
            Handedness::Right => Handedness::Left,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Handedness::Left => "left",
            Handedness::Right => "right",
        }
    }
}

impl fmt::Display for Handedness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Handedness classification together with the model's confidence in it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandLabel {
    pub handedness: Handedness,
    pub confidence: f32,
}

impl HandLabel {
    pub fn new(handedness: Handedness, confidence: f32) -> Self {
        Self {
            handedness,
            confidence,
        }
    }

    /// Swaps left and right, keeping the raw confidence untouched.
    pub fn mirrored(self) -> Self {
        Self {
            handedness: self.handedness.mirrored(),
            confidence: self.confidence,
        }
    }
}

/// One detected hand in one frame or image.
#[derive(Clone, Debug, PartialEq)]
pub struct HandObservation {
    /// Keypoints in the landmark model's fixed order (wrist first).
    pub landmarks: [Landmark; NUM_LANDMARKS],
    /// Label exactly as the model reported it, before the left/right swap.
    pub label: HandLabel,
}

impl HandObservation {
    pub fn new(landmarks: [Landmark; NUM_LANDMARKS], label: HandLabel) -> Self {
        Self { landmarks, label }
    }

    pub fn from_points(points: &[[f32; 3]], label: HandLabel) -> Result<Self, TrackerError> {
        if points.len() != NUM_LANDMARKS {
            return Err(TrackerError::InvalidLandmarkCount {
                expected: NUM_LANDMARKS,
                got: points.len(),
            });
        }

        let mut landmarks = [Landmark::default(); NUM_LANDMARKS];
        for (slot, point) in landmarks.iter_mut().zip(points) {
            *slot = Landmark::from(*point);
        }
        Ok(Self { landmarks, label })
    }
}

/// Hands found in one frame, in the order the model returned them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub hands: Vec<HandObservation>,
}

impl DetectionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.hands.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperatingMode {
    Stream,
    SingleShot,
}

impl OperatingMode {
    pub fn label(&self) -> &'static str {
        match self {
            OperatingMode::Stream => "stream",
            OperatingMode::SingleShot => "single-shot",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready(OperatingMode),
    Running,
    Stopped,
}
