use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the tracking pipeline.
///
/// Finding no hands is not an error; it is an empty [`crate::types::DetectionResult`].
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("landmark model unavailable: {0:#}")]
    ModelUnavailable(anyhow::Error),

    #[error("landmark model session is closed")]
    SessionClosed,

    #[error("capture source unavailable: {0:#}")]
    CaptureUnavailable(anyhow::Error),

    #[error("stream detection requires a frame timestamp")]
    MissingTimestamp,

    #[error("stream detection timestamp {got:?} is not after the previous one ({last:?})")]
    StaleTimestamp { last: Duration, got: Duration },

    #[error("hand detection failed: {0:#}")]
    Detection(anyhow::Error),

    #[error("expected {expected} hand landmarks, got {got}")]
    InvalidLandmarkCount { expected: usize, got: usize },
}

impl TrackerError {
    /// Whether a stream loop hitting this error has to stop instead of emitting an empty result.
    pub fn is_fatal_for_stream(&self) -> bool {
        matches!(
            self,
            TrackerError::SessionClosed | TrackerError::ModelUnavailable(_)
        )
    }
}
