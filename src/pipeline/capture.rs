use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use image::DynamicImage;

use crate::{config::CaptureConfig, error::TrackerError, types::Frame};

/// A live capture handle. The underlying device is released when the handle is dropped.
pub trait CaptureSource: Send {
    /// Most recent frame, if the source has produced one yet.
    fn current_frame(&self) -> Option<Arc<Frame>>;

    fn current_timestamp(&self) -> Option<Duration> {
        self.current_frame().map(|frame| frame.timestamp)
    }
}

/// Acquires capture sources. Failures should be reported as
/// [`TrackerError::CaptureUnavailable`].
pub trait CaptureProvider: Send {
    fn acquire(&mut self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, TrackerError>;
}

/// Converts a decoded still image into a frame with a zero timestamp.
pub fn frame_from_image(image: DynamicImage) -> Frame {
    let rgba = image.into_rgba8();
    let (width, height) = rgba.dimensions();
    Frame::new(rgba.into_raw(), width, height, Duration::ZERO)
}

pub fn load_still_image(path: &Path) -> Result<Frame, TrackerError> {
    let image = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))
        .map_err(TrackerError::CaptureUnavailable)?;
    Ok(frame_from_image(image))
}
