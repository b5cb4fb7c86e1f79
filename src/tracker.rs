//! The tracking session: owns the landmark model, the capture handle and the stream loop, and
//! turns detections into feature vectors for whoever is listening.

use std::{
    ops::ControlFlow,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    config::TrackerConfig,
    error::TrackerError,
    features,
    pipeline::{CaptureProvider, CaptureSource, LandmarkerFactory, ModelSession},
    scheduler::{Admission, CancelToken, FrameScheduler, RepeatingTask, TickDriver},
    types::{DetectionResult, Frame, HandLabel, HandObservation, OperatingMode, SessionState},
};

/// What one processed frame or image produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackingOutput {
    /// Concatenated per-hand feature vectors, in detection order.
    pub features: Vec<f32>,
    pub hand_count: usize,
    /// Hands exactly as the model returned them.
    pub hands: Vec<HandObservation>,
    /// Handedness reported to collaborators: the raw label with left and right swapped.
    pub reported: Vec<HandLabel>,
}

impl TrackingOutput {
    pub fn from_detection(detection: DetectionResult) -> Self {
        let hands = detection.hands;
        Self {
            features: features::extract_combined(&hands),
            hand_count: hands.len(),
            reported: hands.iter().map(|hand| hand.label.mirrored()).collect(),
            hands,
        }
    }

    /// Zero hands; lets listeners clear whatever they showed for the previous frame.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.hand_count == 0
    }
}

enum Tick {
    Idle,
    Emit(TrackingOutput),
    Halt,
}

struct Shared<F> {
    state: SessionState,
    model: ModelSession<F>,
    capture: Option<Box<dyn CaptureSource>>,
    scheduler: FrameScheduler,
    failure: Option<TrackerError>,
}

impl<F: LandmarkerFactory> Shared<F> {
    /// Where a failed `start` or single-shot call leaves the session.
    fn settle(&mut self, prior: SessionState) {
        self.state = match (prior, self.model.mode()) {
            (SessionState::Stopped, _) => SessionState::Stopped,
            (_, Some(mode)) => SessionState::Ready(mode),
            (_, None) => SessionState::Uninitialized,
        };
    }

    fn tick(&mut self, cancel: &CancelToken) -> Tick {
        if cancel.is_cancelled() {
            return Tick::Halt;
        }
        let Some(frame) = self.capture.as_ref().and_then(|capture| capture.current_frame()) else {
            return Tick::Idle;
        };

        match self.scheduler.admit(frame.timestamp) {
            Admission::Duplicate => return Tick::Idle,
            Admission::Skipped => {
                log::trace!("skipping frame at {:?}", frame.timestamp);
                return Tick::Idle;
            }
            Admission::Process => {}
        }
        if cancel.is_cancelled() {
            return Tick::Halt;
        }

        let detection = self
            .model
            .create_or_switch(OperatingMode::Stream)
            .and_then(|()| self.model.detect(&frame, Some(frame.timestamp)));
        match detection {
            Ok(detection) => Tick::Emit(TrackingOutput::from_detection(detection)),
            Err(err) if err.is_fatal_for_stream() => {
                log::error!("tracking loop stopped: {err}");
                self.capture = None;
                self.state = SessionState::Stopped;
                self.failure = Some(err);
                Tick::Halt
            }
            Err(err) => {
                log::warn!(
                    "detection failed for frame at {:?}, reporting no hands: {err}",
                    frame.timestamp
                );
                Tick::Emit(TrackingOutput::empty())
            }
        }
    }
}

fn lock<F>(shared: &Mutex<Shared<F>>) -> MutexGuard<'_, Shared<F>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Orchestrates the stream loop and single-image detection over one landmark model.
///
/// `start`/`stop` may be called any number of times; the capture source is acquired once per
/// `start` and released once per `stop`. Dropping the session stops it.
pub struct TrackingSession<F, P> {
    shared: Arc<Mutex<Shared<F>>>,
    provider: P,
    config: TrackerConfig,
    task: Option<RepeatingTask>,
}

impl<F, P> TrackingSession<F, P>
where
    F: LandmarkerFactory,
    P: CaptureProvider,
{
    pub fn new(factory: F, provider: P, config: TrackerConfig) -> Self {
        let shared = Shared {
            state: SessionState::Uninitialized,
            model: ModelSession::new(factory),
            capture: None,
            scheduler: FrameScheduler::new(config.frame_skip_interval),
            failure: None,
        };
        Self {
            shared: Arc::new(Mutex::new(shared)),
            provider,
            config,
            task: None,
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    /// Mode of the loaded landmark model, if any.
    pub fn mode(&self) -> Option<OperatingMode> {
        lock(&self.shared).model.mode()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Distinct frames seen by the stream loop since the last `start`.
    pub fn frame_counter(&self) -> u64 {
        lock(&self.shared).scheduler.frame_counter()
    }

    /// The error that ended the stream loop, if it died on its own. Reported once.
    pub fn take_failure(&mut self) -> Option<TrackerError> {
        lock(&self.shared).failure.take()
    }

    /// Loads the stream model, acquires the capture source and starts the loop.
    ///
    /// `sink` is called once per processed frame, never concurrently, and never after `stop`
    /// returns. On error the session is left as it was (`Stopped` stays `Stopped`) and nothing
    /// stays acquired.
    pub fn start<D, S>(&mut self, driver: D, mut sink: S) -> Result<(), TrackerError>
    where
        D: TickDriver,
        S: FnMut(&TrackingOutput) + Send + 'static,
    {
        if self.state() == SessionState::Running {
            log::debug!("tracking session already running");
            return Ok(());
        }
        // A loop that died on its own still needs joining.
        if let Some(task) = self.task.take() {
            task.cancel();
        }

        let mut shared = lock(&self.shared);
        let prior = shared.state;
        if let Err(err) = shared.model.create_or_switch(OperatingMode::Stream) {
            shared.settle(prior);
            return Err(err);
        }

        let capture = match self.provider.acquire(&self.config.capture) {
            Ok(capture) => capture,
            Err(err) => {
                log::warn!("could not start tracking: {err}");
                shared.settle(prior);
                return Err(err);
            }
        };

        shared.capture = Some(capture);
        shared.model.restart_timeline();
        shared.scheduler.reset();
        shared.failure = None;
        shared.state = SessionState::Running;
        drop(shared);

        let loop_shared = Arc::clone(&self.shared);
        self.task = Some(RepeatingTask::start(driver, move |cancel| {
            let output = match lock(&loop_shared).tick(cancel) {
                Tick::Idle => return ControlFlow::Continue(()),
                Tick::Halt => return ControlFlow::Break(()),
                Tick::Emit(output) => output,
            };
            if cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            sink(&output);
            ControlFlow::Continue(())
        }));

        log::info!(
            "tracking started, processing 1 in {} frames",
            self.config.frame_skip_interval
        );
        Ok(())
    }

    /// Cancels the loop, waits for an in-flight tick and releases the capture source. The model
    /// is kept warm unless `release_model_on_stop` is set. Calling it again does nothing.
    pub fn stop(&mut self) {
        let had_loop = match self.task.take() {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        };

        let mut shared = lock(&self.shared);
        if !had_loop && shared.state != SessionState::Running {
            log::debug!("tracking session not running, nothing to stop");
            return;
        }

        if shared.capture.take().is_some() {
            log::info!("capture source released");
        }
        shared.state = SessionState::Stopped;
        if self.config.release_model_on_stop {
            shared.model.release();
        }
        log::info!("tracking stopped");
    }

    /// Runs detection on one still image, outside the stream loop.
    ///
    /// Returns `Ok(None)` when no hand is found. While the loop is running this swaps the model to
    /// single-shot mode; the loop swaps it back on its next processed frame and keeps its frame
    /// counter.
    pub fn detect_single_image(
        &mut self,
        image: &Frame,
    ) -> Result<Option<TrackingOutput>, TrackerError> {
        let mut shared = lock(&self.shared);
        let prior = shared.state;
        let running = prior == SessionState::Running;

        let detection = shared
            .model
            .create_or_switch(OperatingMode::SingleShot)
            .and_then(|()| shared.model.detect(image, None));
        let detection = match detection {
            Ok(detection) => detection,
            Err(err) => {
                if !running {
                    shared.settle(prior);
                }
                return Err(err);
            }
        };
        if !running {
            shared.state = SessionState::Ready(OperatingMode::SingleShot);
        }

        if detection.is_empty() {
            log::debug!("no hands found in still image");
            return Ok(None);
        }
        Ok(Some(TrackingOutput::from_detection(detection)))
    }
}

impl<F, P> Drop for TrackingSession<F, P> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
        }
        let mut shared = lock(&self.shared);
        if shared.capture.take().is_some() {
            log::debug!("capture source released on drop");
        }
    }
}
