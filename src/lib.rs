//! Hand tracking and feature extraction.
//!
//! Frames come from a camera or a still image, a landmark model finds up to two hands, and each
//! hand's 21 keypoints become 210 pairwise distances for a downstream gesture classifier.

pub mod config;
pub mod error;
pub mod features;
pub mod model_download;
pub mod pipeline;
pub mod scheduler;
pub mod tracker;
pub mod transport;
pub mod types;

pub use config::{CaptureConfig, TrackerConfig};
pub use error::TrackerError;
pub use tracker::{TrackingOutput, TrackingSession};
pub use transport::{ConfidenceGate, FeatureMessage, FeatureTransport, JsonLinesTransport};
pub use types::{
    DetectionResult, Frame, HandLabel, HandObservation, Handedness, Landmark, OperatingMode,
    SessionState,
};
