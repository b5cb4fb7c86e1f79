use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use crossbeam_channel::bounded;
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    query,
    utils::{
        ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
        Resolution,
    },
};

use super::{
    capture::{CaptureProvider, CaptureSource},
    rgba_converter::{self, RgbaImage},
};
use crate::{config::CaptureConfig, error::TrackerError, types::Frame};

// Built-in macOS cameras often reject YUYV even when it is reported, so raw formats go first.
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::GRAY,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
];

fn requested_formats(config: &CaptureConfig) -> Vec<RequestedFormat<'static>> {
    let resolution = Resolution::new(config.width, config.height);
    let mut requests: Vec<RequestedFormat<'static>> = PREFERRED_PIXEL_FORMATS
        .iter()
        .map(|format| {
            RequestedFormat::with_formats(
                RequestedFormatType::Closest(CameraFormat::new(
                    resolution,
                    *format,
                    config.frame_rate,
                )),
                PREFERRED_PIXEL_FORMATS,
            )
        })
        .collect();
    requests.push(RequestedFormat::with_formats(
        RequestedFormatType::AbsoluteHighestFrameRate,
        PREFERRED_PIXEL_FORMATS,
    ));
    requests.push(RequestedFormat::new::<RgbFormat>(RequestedFormatType::None));
    requests
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: u32,
    pub label: String,
}

pub fn available_cameras() -> Result<Vec<CameraDevice>> {
    let cameras = query(ApiBackend::Auto)?;
    Ok(cameras
        .into_iter()
        .filter_map(|info| match info.index() {
            CameraIndex::Index(index) => Some(CameraDevice {
                index: *index,
                label: info.human_name(),
            }),
            CameraIndex::String(_) => None,
        })
        .collect())
}

fn open_camera(config: &CaptureConfig) -> Result<Camera> {
    let mut last_err = None;
    for requested in requested_formats(config) {
        match Camera::new(CameraIndex::Index(config.camera_index), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("no requested camera format was accepted")))
}

/// Opens cameras through nokhwa. Each capture runs on its own thread and publishes frames, as
/// the sensor delivers them, to a single latest-frame slot.
#[derive(Clone, Debug, Default)]
pub struct NokhwaCameraProvider;

impl CaptureProvider for NokhwaCameraProvider {
    fn acquire(&mut self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, TrackerError> {
        let stream = CameraStream::open(config.clone()).map_err(TrackerError::CaptureUnavailable)?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug)]
pub struct CameraStream {
    latest: Arc<Mutex<Option<Arc<Frame>>>>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CameraStream {
    /// Starts capturing and returns once the camera has accepted a format, or with the reason
    /// it could not be opened.
    pub fn open(config: CaptureConfig) -> Result<Self> {
        let latest = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let slot = latest.clone();
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut camera = match open_camera(&config) {
                Ok(camera) => {
                    let _ = ready_tx.send(Ok(()));
                    camera
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            log::info!(
                "camera {} streaming at {:?}",
                config.camera_index,
                camera.camera_format()
            );
            run_capture_loop(&mut camera, &slot, &stop_flag);
            if let Err(err) = camera.stop_stream() {
                log::warn!("failed to stop camera stream: {err:?}");
            }
        });

        let opened = ready_rx
            .recv()
            .map_err(|_| anyhow!("camera thread exited before reporting"))
            .and_then(|result| result);
        if let Err(err) = opened {
            let _ = handle.join();
            return Err(err);
        }

        Ok(Self {
            latest,
            stop,
            handle: Some(handle),
        })
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            log::info!("camera released");
        }
    }
}

/// Spacing for retries after failed camera reads: doubles per consecutive failure, up to a cap.
#[derive(Debug, Default)]
struct ReadBackoff {
    failures: u32,
}

impl ReadBackoff {
    const BASE: Duration = Duration::from_millis(10);
    const MAX: Duration = Duration::from_millis(500);

    /// Records a failure and returns how long to wait before the next read.
    fn failed(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let shift = (self.failures - 1).min(6);
        (Self::BASE * (1u32 << shift)).min(Self::MAX)
    }

    /// Only the first failure of a streak and every power of two after it get logged.
    fn should_log(&self) -> bool {
        self.failures.is_power_of_two()
    }

    fn succeeded(&mut self) {
        if self.failures > 1 {
            log::info!("camera recovered after {} failed reads", self.failures);
        }
        self.failures = 0;
    }
}

fn run_capture_loop(
    camera: &mut Camera,
    slot: &Mutex<Option<Arc<Frame>>>,
    stop: &AtomicBool,
) {
    let started = Instant::now();
    let mut backoff = ReadBackoff::default();
    while !stop.load(Ordering::Relaxed) {
        let buffer = match camera.frame() {
            Ok(buffer) => {
                backoff.succeeded();
                buffer
            }
            Err(err) => {
                let delay = backoff.failed();
                if backoff.should_log() {
                    log::warn!(
                        "camera frame read failed ({} in a row): {err:?}",
                        backoff.failures
                    );
                }
                thread::sleep(delay);
                continue;
            }
        };
        let timestamp = started.elapsed();

        let image: RgbaImage = match rgba_converter::convert_camera_buffer(&buffer) {
            Ok(image) => image,
            Err(err) => {
                log::warn!("failed to decode camera frame: {err:?}");
                continue;
            }
        };

        let frame = Frame::new(image.rgba, image.width, image.height, timestamp);
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(frame));
    }
}

impl CaptureSource for CameraStream {
    fn current_frame(&self) -> Option<Arc<Frame>> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}
