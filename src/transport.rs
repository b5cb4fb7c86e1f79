//! Messages exchanged with the gesture classifier, and a transport to send them over.

use std::io::Write;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{tracker::TrackingOutput, types::Handedness};

/// Label reported for predictions the classifier is not confident about.
pub const UNKNOWN_LABEL: &str = "Unknown";

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.80;

/// Feature vectors on their way to the classifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeatureMessage {
    /// One hand: 210 features.
    Features { features: Vec<f32>, hand: Handedness },
    /// Two hands: 420 features, in detection order.
    FeaturesDual {
        features: Vec<f32>,
        hands: Vec<Handedness>,
    },
}

impl FeatureMessage {
    /// Builds the message for a tracking result, using the reported (swapped) handedness. Returns `None`
    /// when there are no hands to classify.
    pub fn from_output(output: &TrackingOutput) -> Option<Self> {
        match output.reported.as_slice() {
            [] => None,
            [only] => Some(FeatureMessage::Features {
                features: output.features.clone(),
                hand: only.handedness,
            }),
            labels => Some(FeatureMessage::FeaturesDual {
                features: output.features.clone(),
                hands: labels.iter().map(|label| label.handedness).collect(),
            }),
        }
    }

    pub fn features(&self) -> &[f32] {
        match self {
            FeatureMessage::Features { features, .. }
            | FeatureMessage::FeaturesDual { features, .. } => features,
        }
    }
}

/// Delivers feature messages to the classifier.
pub trait FeatureTransport: Send {
    fn send(&mut self, message: &FeatureMessage) -> anyhow::Result<()>;
}

/// Writes each message as one line of JSON.
#[derive(Debug)]
pub struct JsonLinesTransport<W> {
    writer: W,
}

impl<W: Write + Send> JsonLinesTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> FeatureTransport for JsonLinesTransport<W> {
    fn send(&mut self, message: &FeatureMessage) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, message)
            .context("failed to serialize feature message")?;
        self.writer
            .write_all(b"\n")
            .and_then(|()| self.writer.flush())
            .context("failed to write feature message")
    }
}

/// The classifier's reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand: Option<Handedness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hands: Option<Vec<Handedness>>,
}

/// Treats low-confidence predictions as [`UNKNOWN_LABEL`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConfidenceGate {
    pub threshold: f32,
}

impl Default for ConfidenceGate {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl ConfidenceGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Confidence has to be strictly above the threshold.
    pub fn accepts(&self, prediction: &Prediction) -> bool {
        prediction.confidence > self.threshold
    }

    pub fn label<'a>(&self, prediction: &'a Prediction) -> &'a str {
        if self.accepts(prediction) {
            &prediction.prediction
        } else {
            UNKNOWN_LABEL
        }
    }
}
