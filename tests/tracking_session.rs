use std::{
    collections::VecDeque,
    num::NonZeroU32,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use pretty_assertions::assert_eq;

use hand_features::{
    CaptureConfig, DetectionResult, Frame, HandLabel, HandObservation, Handedness, Landmark,
    OperatingMode, SessionState, TrackerConfig, TrackerError, TrackingOutput, TrackingSession,
    features::{FEATURES_PER_HAND, extract_one},
    pipeline::{CaptureProvider, CaptureSource, HandLandmarker, LandmarkerFactory},
    scheduler::{HostTicker, host_ticks},
    types::NUM_LANDMARKS,
};

#[derive(Default)]
struct ModelLog {
    created: Vec<OperatingMode>,
    live: usize,
    max_live: usize,
    detects: Vec<(OperatingMode, Option<Duration>)>,
    script: VecDeque<Result<DetectionResult, TrackerError>>,
    default_hands: Vec<HandObservation>,
    fail_create: bool,
}

struct FakeFactory {
    log: Arc<Mutex<ModelLog>>,
}

struct FakeLandmarker {
    mode: OperatingMode,
    log: Arc<Mutex<ModelLog>>,
}

impl LandmarkerFactory for FakeFactory {
    fn create(
        &mut self,
        mode: OperatingMode,
        _max_hands: usize,
    ) -> Result<Box<dyn HandLandmarker>, TrackerError> {
        let mut log = self.log.lock().unwrap();
        if log.fail_create {
            return Err(TrackerError::ModelUnavailable(anyhow!("no compute backend")));
        }
        log.created.push(mode);
        log.live += 1;
        log.max_live = log.max_live.max(log.live);
        Ok(Box::new(FakeLandmarker {
            mode,
            log: self.log.clone(),
        }))
    }
}

impl HandLandmarker for FakeLandmarker {
    fn detect(
        &mut self,
        _frame: &Frame,
        timestamp: Option<Duration>,
    ) -> Result<DetectionResult, TrackerError> {
        let mut log = self.log.lock().unwrap();
        log.detects.push((self.mode, timestamp));
        match log.script.pop_front() {
            Some(result) => result,
            None => Ok(DetectionResult {
                hands: log.default_hands.clone(),
            }),
        }
    }
}

impl Drop for FakeLandmarker {
    fn drop(&mut self) {
        self.log.lock().unwrap().live -= 1;
    }
}

#[derive(Default)]
struct CaptureLog {
    queue: VecDeque<Duration>,
    last: Option<Duration>,
    acquired: usize,
    released: usize,
    fail: bool,
}

struct FakeProvider {
    log: Arc<Mutex<CaptureLog>>,
}

struct FakeCapture {
    log: Arc<Mutex<CaptureLog>>,
}

impl CaptureProvider for FakeProvider {
    fn acquire(&mut self, _config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, TrackerError> {
        let mut log = self.log.lock().unwrap();
        if log.fail {
            return Err(TrackerError::CaptureUnavailable(anyhow!("permission denied")));
        }
        log.acquired += 1;
        Ok(Box::new(FakeCapture {
            log: self.log.clone(),
        }))
    }
}

impl CaptureSource for FakeCapture {
    /// Hands out queued timestamps one per call, then keeps repeating the last one.
    fn current_frame(&self) -> Option<Arc<Frame>> {
        let mut log = self.log.lock().unwrap();
        if let Some(ts) = log.queue.pop_front() {
            log.last = Some(ts);
        }
        log.last
            .map(|ts| Arc::new(Frame::new(vec![0; 4], 1, 1, ts)))
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.log.lock().unwrap().released += 1;
    }
}

struct Harness {
    models: Arc<Mutex<ModelLog>>,
    capture: Arc<Mutex<CaptureLog>>,
    outputs: Arc<Mutex<Vec<TrackingOutput>>>,
    ticker: Option<HostTicker>,
    session: TrackingSession<FakeFactory, FakeProvider>,
}

impl Harness {
    fn new(config: TrackerConfig) -> Self {
        let models = Arc::new(Mutex::new(ModelLog::default()));
        let capture = Arc::new(Mutex::new(CaptureLog::default()));
        let session = TrackingSession::new(
            FakeFactory {
                log: models.clone(),
            },
            FakeProvider {
                log: capture.clone(),
            },
            config,
        );
        Self {
            models,
            capture,
            outputs: Arc::new(Mutex::new(Vec::new())),
            ticker: None,
            session,
        }
    }

    fn with_skip(interval: u32) -> Self {
        Self::new(TrackerConfig::default().with_frame_skip_interval(skip(interval)))
    }

    fn start(&mut self) -> Result<(), TrackerError> {
        let (ticker, driver) = host_ticks();
        let outputs = self.outputs.clone();
        self.session
            .start(driver, move |output| outputs.lock().unwrap().push(output.clone()))?;
        self.ticker = Some(ticker);
        Ok(())
    }

    /// Queues one frame per timestamp and runs one tick per frame. Returns once every one of
    /// those ticks has completed.
    fn feed(&self, timestamps_ms: &[u64]) {
        let ticker = self.ticker.as_ref().unwrap();
        self.capture
            .lock()
            .unwrap()
            .queue
            .extend(timestamps_ms.iter().map(|&ms| Duration::from_millis(ms)));
        for _ in timestamps_ms {
            assert!(ticker.tick());
        }
        // The queue is drained, so this tick only sees a repeated frame. The rendezvous
        // hand-over means it is accepted only after the previous tick finished.
        ticker.tick();
    }

    fn set_hands(&self, hands: Vec<HandObservation>) {
        self.models.lock().unwrap().default_hands = hands;
    }

    fn stream_detects(&self) -> usize {
        self.models
            .lock()
            .unwrap()
            .detects
            .iter()
            .filter(|(mode, _)| *mode == OperatingMode::Stream)
            .count()
    }

    fn outputs(&self) -> Vec<TrackingOutput> {
        self.outputs.lock().unwrap().clone()
    }
}

fn skip(interval: u32) -> NonZeroU32 {
    NonZeroU32::new(interval).unwrap()
}

fn hand(seed: f32, handedness: Handedness) -> HandObservation {
    let mut landmarks = [Landmark::default(); NUM_LANDMARKS];
    for (i, landmark) in landmarks.iter_mut().enumerate() {
        let i = i as f32;
        *landmark = Landmark::new(seed + 0.02 * i, 0.3 + 0.01 * i * i, 0.005 * i);
    }
    HandObservation::new(landmarks, HandLabel::new(handedness, 0.87))
}

fn still_image() -> Frame {
    Frame::new(vec![0; 16], 2, 2, Duration::ZERO)
}

#[test]
fn frame_skip_processes_one_in_three_distinct_frames() {
    let mut harness = Harness::with_skip(3);
    harness.set_hands(vec![hand(0.1, Handedness::Left)]);
    harness.start().unwrap();

    harness.feed(&[10, 20, 30, 40, 50, 60, 70, 80, 90]);
    assert_eq!(harness.stream_detects(), 3);
    assert_eq!(harness.outputs().len(), 3);

    let timestamps: Vec<Option<Duration>> = harness
        .models
        .lock()
        .unwrap()
        .detects
        .iter()
        .map(|(_, ts)| *ts)
        .collect();
    assert_eq!(
        timestamps,
        vec![
            Some(Duration::from_millis(30)),
            Some(Duration::from_millis(60)),
            Some(Duration::from_millis(90)),
        ]
    );
    harness.session.stop();
}

#[test]
fn repeated_timestamps_trigger_nothing() {
    let mut harness = Harness::with_skip(1);
    harness.start().unwrap();

    harness.feed(&[5, 5, 5, 7, 7, 9]);
    assert_eq!(harness.stream_detects(), 3);
    assert_eq!(harness.outputs().len(), 3);
    assert_eq!(harness.session.frame_counter(), 3);

    // Nothing new from the camera: no detection, no callback.
    harness.feed(&[]);
    harness.feed(&[]);
    assert_eq!(harness.stream_detects(), 3);
    assert_eq!(harness.outputs().len(), 3);
    harness.session.stop();
}

#[test]
fn zero_hands_emit_an_empty_result() {
    let mut harness = Harness::with_skip(1);
    harness.start().unwrap();

    harness.feed(&[1]);
    let outputs = harness.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].features, Vec::<f32>::new());
    assert_eq!(outputs[0].hand_count, 0);
    assert_eq!(outputs[0].hands, Vec::new());
    harness.session.stop();
}

#[test]
fn two_hands_concatenate_in_detection_order() {
    let first = hand(0.6, Handedness::Right);
    let second = hand(0.1, Handedness::Left);

    let mut harness = Harness::with_skip(1);
    harness.set_hands(vec![first.clone(), second.clone()]);
    harness.start().unwrap();
    harness.feed(&[1]);
    harness.session.stop();

    let outputs = harness.outputs();
    let output = &outputs[0];
    assert_eq!(output.hand_count, 2);
    assert_eq!(output.features.len(), 2 * FEATURES_PER_HAND);

    let mut expected = extract_one(&first);
    expected.extend(extract_one(&second));
    assert_eq!(output.features, expected);
    assert_eq!(output.hands, vec![first, second]);
}

#[test]
fn handedness_is_swapped_on_both_paths() {
    let mut harness = Harness::with_skip(1);
    harness.set_hands(vec![hand(0.1, Handedness::Left), hand(0.5, Handedness::Right)]);
    harness.start().unwrap();
    harness.feed(&[1]);
    harness.session.stop();

    let reported: Vec<Handedness> = harness.outputs()[0]
        .reported
        .iter()
        .map(|label| label.handedness)
        .collect();
    assert_eq!(reported, vec![Handedness::Right, Handedness::Left]);

    harness.set_hands(vec![hand(0.1, Handedness::Right)]);
    let single = harness
        .session
        .detect_single_image(&still_image())
        .unwrap()
        .unwrap();
    assert_eq!(single.reported, vec![HandLabel::new(Handedness::Left, 0.87)]);
    assert_eq!(single.hands[0].label.handedness, Handedness::Right);
}

#[test]
fn stream_and_still_image_agree_on_the_same_detection() {
    let mut harness = Harness::with_skip(1);
    harness.set_hands(vec![hand(0.3, Handedness::Left)]);
    harness.start().unwrap();
    harness.feed(&[1]);
    harness.session.stop();

    let streamed = harness.outputs().remove(0);
    let still = harness
        .session
        .detect_single_image(&still_image())
        .unwrap()
        .unwrap();

    assert_eq!(streamed.reported, still.reported);
    assert_eq!(streamed.reported, vec![HandLabel::new(Handedness::Right, 0.87)]);
    assert_eq!(streamed.features, still.features);
}

#[test]
fn stop_is_idempotent_and_releases_capture_once() {
    let mut harness = Harness::with_skip(1);
    harness.start().unwrap();
    harness.feed(&[1, 2]);

    harness.session.stop();
    assert_eq!(harness.session.state(), SessionState::Stopped);
    harness.session.stop();
    assert_eq!(harness.session.state(), SessionState::Stopped);

    let capture = harness.capture.lock().unwrap();
    assert_eq!((capture.acquired, capture.released), (1, 1));
}

#[test]
fn start_while_running_does_not_reacquire() {
    let mut harness = Harness::with_skip(1);
    harness.start().unwrap();
    harness.start().unwrap();
    assert_eq!(harness.capture.lock().unwrap().acquired, 1);
    harness.session.stop();
}

#[test]
fn no_callback_after_stop() {
    let mut harness = Harness::with_skip(1);
    harness.start().unwrap();
    harness.feed(&[1]);
    harness.session.stop();

    let ticker = harness.ticker.take().unwrap();
    assert!(!ticker.tick());
    assert_eq!(harness.outputs().len(), 1);
}

#[test]
fn model_stays_warm_across_restarts_by_default() {
    let mut harness = Harness::with_skip(1);
    harness.start().unwrap();
    harness.feed(&[1]);
    harness.session.stop();
    assert_eq!(harness.models.lock().unwrap().live, 1);

    // A new capture restarts its clock; the warm model must accept it.
    harness.start().unwrap();
    harness.feed(&[1]);
    harness.session.stop();
    assert_eq!(harness.stream_detects(), 2);

    let models = harness.models.lock().unwrap();
    assert_eq!(models.created, vec![OperatingMode::Stream]);
    let capture = harness.capture.lock().unwrap();
    assert_eq!((capture.acquired, capture.released), (2, 2));
}

#[test]
fn release_on_stop_drops_the_model() {
    let mut harness = Harness::new(
        TrackerConfig::default()
            .with_frame_skip_interval(skip(1))
            .with_release_model_on_stop(true),
    );
    harness.start().unwrap();
    harness.feed(&[1]);
    harness.session.stop();

    assert_eq!(harness.models.lock().unwrap().live, 0);
    assert_eq!(harness.session.mode(), None);
}

#[test]
fn single_image_during_stream_keeps_frame_counter() {
    let mut harness = Harness::with_skip(3);
    harness.set_hands(vec![hand(0.2, Handedness::Left)]);
    harness.start().unwrap();

    harness.feed(&[1, 2, 3, 4]);
    assert_eq!(harness.stream_detects(), 1);
    assert_eq!(harness.session.frame_counter(), 4);

    let still = harness
        .session
        .detect_single_image(&still_image())
        .unwrap();
    assert!(still.is_some());
    assert_eq!(harness.session.state(), SessionState::Running);
    assert_eq!(harness.session.mode(), Some(OperatingMode::SingleShot));

    // Counter continues from 4: frame 6 is the next one processed.
    harness.feed(&[5, 6]);
    assert_eq!(harness.stream_detects(), 2);
    assert_eq!(harness.session.frame_counter(), 6);
    assert_eq!(harness.session.mode(), Some(OperatingMode::Stream));
    harness.session.stop();

    let models = harness.models.lock().unwrap();
    assert_eq!(
        models.created,
        vec![
            OperatingMode::Stream,
            OperatingMode::SingleShot,
            OperatingMode::Stream,
        ]
    );
    assert_eq!(models.max_live, 1);
    assert_eq!(harness.outputs.lock().unwrap().len(), 2);
}

#[test]
fn single_image_without_hands_is_no_detection() {
    let mut harness = Harness::with_skip(1);
    let result = harness.session.detect_single_image(&still_image()).unwrap();

    assert_eq!(result, None);
    assert_eq!(
        harness.session.state(),
        SessionState::Ready(OperatingMode::SingleShot)
    );
    assert_eq!(harness.capture.lock().unwrap().acquired, 0);
}

#[test]
fn capture_failure_leaves_nothing_acquired() {
    let mut harness = Harness::with_skip(1);
    harness.capture.lock().unwrap().fail = true;

    let err = harness.start().unwrap_err();
    assert!(matches!(err, TrackerError::CaptureUnavailable(_)));
    assert_eq!(
        harness.session.state(),
        SessionState::Ready(OperatingMode::Stream)
    );

    // A stopped session stays stopped when the camera is refused.
    harness.capture.lock().unwrap().fail = false;
    harness.start().unwrap();
    harness.session.stop();
    harness.capture.lock().unwrap().fail = true;
    assert!(harness.start().is_err());
    assert_eq!(harness.session.state(), SessionState::Stopped);
}

#[test]
fn model_failure_aborts_start_before_capture() {
    let mut harness = Harness::with_skip(1);
    harness.models.lock().unwrap().fail_create = true;

    let err = harness.start().unwrap_err();
    assert!(matches!(err, TrackerError::ModelUnavailable(_)));
    assert_eq!(harness.session.state(), SessionState::Uninitialized);
    assert_eq!(harness.capture.lock().unwrap().acquired, 0);
}

#[test]
fn transient_detection_failure_emits_no_hands() {
    let mut harness = Harness::with_skip(1);
    harness.set_hands(vec![hand(0.1, Handedness::Left)]);
    harness
        .models
        .lock()
        .unwrap()
        .script
        .push_back(Err(TrackerError::Detection(anyhow!("inference glitch"))));
    harness.start().unwrap();

    harness.feed(&[1, 2]);
    harness.session.stop();

    let counts: Vec<usize> = harness.outputs().iter().map(|o| o.hand_count).collect();
    assert_eq!(counts, vec![0, 1]);
    assert!(harness.session.take_failure().is_none());
}

#[test]
fn closed_session_stops_the_loop_and_reports_once() {
    let mut harness = Harness::with_skip(1);
    harness
        .models
        .lock()
        .unwrap()
        .script
        .push_back(Err(TrackerError::SessionClosed));
    harness.start().unwrap();

    let ticker = harness.ticker.take().unwrap();
    harness.capture.lock().unwrap().queue.push_back(Duration::from_millis(1));
    assert!(ticker.tick());
    // The loop exits after the failing tick, so no further tick is accepted.
    assert!(!ticker.tick());

    assert_eq!(harness.session.state(), SessionState::Stopped);
    assert!(harness.outputs().is_empty());
    assert!(matches!(
        harness.session.take_failure(),
        Some(TrackerError::SessionClosed)
    ));
    assert!(harness.session.take_failure().is_none());

    harness.session.stop();
    let capture = harness.capture.lock().unwrap();
    assert_eq!((capture.acquired, capture.released), (1, 1));
}

#[test]
fn session_can_restart_after_the_loop_died() {
    let mut harness = Harness::with_skip(1);
    harness
        .models
        .lock()
        .unwrap()
        .script
        .push_back(Err(TrackerError::SessionClosed));
    harness.start().unwrap();
    let ticker = harness.ticker.take().unwrap();
    harness.capture.lock().unwrap().queue.push_back(Duration::from_millis(1));
    ticker.tick();
    while ticker.tick() {}

    harness.start().unwrap();
    assert_eq!(harness.session.state(), SessionState::Running);
    harness.feed(&[2]);
    harness.session.stop();
    assert_eq!(harness.outputs().len(), 1);
}
