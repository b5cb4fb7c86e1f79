use std::{num::NonZeroU32, time::Duration};

/// Process one out of every three distinct frames (~10 fps from a 30 fps camera).
pub const DEFAULT_FRAME_SKIP_INTERVAL: NonZeroU32 = match NonZeroU32::new(3) {
    Some(interval) => interval,
    None => unreachable!(),
};

/// Roughly one display refresh at 60 Hz.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(16);

/// What to ask of the camera when a stream starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub frame_skip_interval: NonZeroU32,
    pub tick_interval: Duration,
    /// Drop the landmark model on `stop()` instead of keeping it warm for the next `start()`.
    pub release_model_on_stop: bool,
    pub capture: CaptureConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            frame_skip_interval: DEFAULT_FRAME_SKIP_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            release_model_on_stop: false,
            capture: CaptureConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn with_frame_skip_interval(mut self, interval: NonZeroU32) -> Self {
        self.frame_skip_interval = interval;
        self
    }

    pub fn with_release_model_on_stop(mut self, release: bool) -> Self {
        self.release_model_on_stop = release;
        self
    }
}
