#[cfg(feature = "landmarker-ort")]
mod common;
#[cfg(feature = "landmarker-ort")]
mod ort;
#[cfg(feature = "landmarker-ort")]
mod palm;

use std::time::Duration;

#[cfg(feature = "landmarker-ort")]
pub use self::ort::OrtLandmarkerFactory;
use crate::{
    error::TrackerError,
    types::{DetectionResult, Frame, MAX_HANDS, OperatingMode},
};

/// One live instance of an external hand landmark model, bound to a single operating mode.
///
/// Dropping the landmarker releases whatever it holds (model sessions, compute buffers).
pub trait HandLandmarker: Send {
    /// Finds up to the configured number of hands. An empty result is not an error.
    ///
    /// `timestamp` is `Some` in stream mode and `None` for single images.
    fn detect(
        &mut self,
        frame: &Frame,
        timestamp: Option<Duration>,
    ) -> Result<DetectionResult, TrackerError>;

    /// Forgets anything carried over from earlier frames. Called when a new stream begins.
    fn reset_tracking(&mut self) {}
}

/// Builds landmarkers. Failures should be reported as [`TrackerError::ModelUnavailable`].
pub trait LandmarkerFactory: Send + 'static {
    fn create(
        &mut self,
        mode: OperatingMode,
        max_hands: usize,
    ) -> Result<Box<dyn HandLandmarker>, TrackerError>;
}

struct ActiveLandmarker {
    mode: OperatingMode,
    landmarker: Box<dyn HandLandmarker>,
    last_timestamp: Option<Duration>,
}

/// Owns at most one landmarker at a time and enforces the detection contract around it.
pub struct ModelSession<F> {
    factory: F,
    max_hands: usize,
    active: Option<ActiveLandmarker>,
}

impl<F: LandmarkerFactory> ModelSession<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            max_hands: MAX_HANDS,
            active: None,
        }
    }

    pub fn mode(&self) -> Option<OperatingMode> {
        self.active.as_ref().map(|active| active.mode)
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Makes sure a landmarker for `mode` is loaded. The previous landmarker, if any, is
    /// released before the new one is built, so two never coexist.
    pub fn create_or_switch(&mut self, mode: OperatingMode) -> Result<(), TrackerError> {
        if self.mode() == Some(mode) {
            return Ok(());
        }

        if let Some(previous) = self.active.take() {
            log::info!(
                "switching landmark session from {} to {}",
                previous.mode.label(),
                mode.label()
            );
            drop(previous);
        }

        let landmarker = self.factory.create(mode, self.max_hands)?;
        log::info!("landmark session ready in {} mode", mode.label());
        self.active = Some(ActiveLandmarker {
            mode,
            landmarker,
            last_timestamp: None,
        });
        Ok(())
    }

    pub fn detect(
        &mut self,
        frame: &Frame,
        timestamp: Option<Duration>,
    ) -> Result<DetectionResult, TrackerError> {
        let active = self.active.as_mut().ok_or(TrackerError::SessionClosed)?;

        let timestamp = match active.mode {
            OperatingMode::Stream => {
                let ts = timestamp.ok_or(TrackerError::MissingTimestamp)?;
                if let Some(last) = active.last_timestamp {
                    if ts <= last {
                        return Err(TrackerError::StaleTimestamp { last, got: ts });
                    }
                }
                active.last_timestamp = Some(ts);
                Some(ts)
            }
            OperatingMode::SingleShot => None,
        };

        let mut result = active.landmarker.detect(frame, timestamp)?;
        if result.hands.len() > self.max_hands {
            log::debug!(
                "landmarker returned {} hands, keeping the first {}",
                result.hands.len(),
                self.max_hands
            );
            result.hands.truncate(self.max_hands);
        }
        Ok(result)
    }

    /// Starts a new timestamp timeline, for a capture whose clock restarted.
    pub fn restart_timeline(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.last_timestamp = None;
            active.landmarker.reset_tracking();
        }
    }

    pub fn release(&mut self) {
        if let Some(active) = self.active.take() {
            log::info!("released {} landmark session", active.mode.label());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HandLabel, HandObservation, Handedness, Landmark, NUM_LANDMARKS};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Clone, Default)]
    struct Counters {
        created: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
        max_live: Arc<AtomicUsize>,
    }

    struct CountingFactory {
        counters: Counters,
        hands_per_frame: usize,
        fail: bool,
    }

    struct CountingLandmarker {
        live: Arc<AtomicUsize>,
        hands_per_frame: usize,
    }

    impl Drop for CountingLandmarker {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl HandLandmarker for CountingLandmarker {
        fn detect(
            &mut self,
            _frame: &Frame,
            _timestamp: Option<Duration>,
        ) -> Result<DetectionResult, TrackerError> {
            let hand = HandObservation::new(
                [Landmark::default(); NUM_LANDMARKS],
                HandLabel::new(Handedness::Left, 0.7),
            );
            Ok(DetectionResult {
                hands: vec![hand; self.hands_per_frame],
            })
        }
    }

    impl LandmarkerFactory for CountingFactory {
        fn create(
            &mut self,
            _mode: OperatingMode,
            _max_hands: usize,
        ) -> Result<Box<dyn HandLandmarker>, TrackerError> {
            if self.fail {
                return Err(TrackerError::ModelUnavailable(anyhow::anyhow!(
                    "no compute backend"
                )));
            }
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(CountingLandmarker {
                live: self.counters.live.clone(),
                hands_per_frame: self.hands_per_frame,
            }))
        }
    }

    fn session(hands_per_frame: usize) -> (ModelSession<CountingFactory>, Counters) {
        let counters = Counters::default();
        let factory = CountingFactory {
            counters: counters.clone(),
            hands_per_frame,
            fail: false,
        };
        (ModelSession::new(factory), counters)
    }

    fn frame() -> Frame {
        Frame::new(vec![0; 4], 1, 1, Duration::ZERO)
    }

    #[test]
    fn create_or_switch_is_idempotent_per_mode() {
        let (mut session, counters) = session(1);
        session.create_or_switch(OperatingMode::Stream).unwrap();
        session.create_or_switch(OperatingMode::Stream).unwrap();
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);

        session.create_or_switch(OperatingMode::SingleShot).unwrap();
        assert_eq!(session.mode(), Some(OperatingMode::SingleShot));
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(counters.live.load(Ordering::SeqCst), 1);
        assert_eq!(counters.max_live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detect_after_release_reports_closed_session() {
        let (mut session, counters) = session(1);
        assert!(matches!(
            session.detect(&frame(), None),
            Err(TrackerError::SessionClosed)
        ));

        session.create_or_switch(OperatingMode::SingleShot).unwrap();
        assert_eq!(session.detect(&frame(), None).unwrap().hands.len(), 1);

        session.release();
        assert!(!session.is_open());
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert!(matches!(
            session.detect(&frame(), None),
            Err(TrackerError::SessionClosed)
        ));
    }

    #[test]
    fn stream_detect_requires_increasing_timestamps() {
        let (mut session, _) = session(0);
        session.create_or_switch(OperatingMode::Stream).unwrap();

        assert!(matches!(
            session.detect(&frame(), None),
            Err(TrackerError::MissingTimestamp)
        ));
        let t1 = Duration::from_millis(33);
        assert!(session.detect(&frame(), Some(t1)).unwrap().is_empty());
        assert!(matches!(
            session.detect(&frame(), Some(t1)),
            Err(TrackerError::StaleTimestamp { .. })
        ));
        assert!(session.detect(&frame(), Some(t1 * 2)).is_ok());
    }

    #[test]
    fn switching_mode_resets_timestamp_history() {
        let (mut session, _) = session(0);
        let t = Duration::from_millis(100);
        session.create_or_switch(OperatingMode::Stream).unwrap();
        session.detect(&frame(), Some(t)).unwrap();

        session.create_or_switch(OperatingMode::SingleShot).unwrap();
        session.create_or_switch(OperatingMode::Stream).unwrap();
        assert!(session.detect(&frame(), Some(t)).is_ok());
    }

    #[test]
    fn restarted_timeline_accepts_earlier_timestamps() {
        let (mut session, counters) = session(0);
        session.create_or_switch(OperatingMode::Stream).unwrap();
        session
            .detect(&frame(), Some(Duration::from_secs(5)))
            .unwrap();

        session.restart_timeline();
        assert!(session.detect(&frame(), Some(Duration::from_millis(1))).is_ok());
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn results_are_capped_at_two_hands() {
        let (mut session, _) = session(3);
        session.create_or_switch(OperatingMode::SingleShot).unwrap();
        assert_eq!(session.detect(&frame(), None).unwrap().hands.len(), MAX_HANDS);
    }

    #[test]
    fn factory_failure_leaves_session_closed() {
        let counters = Counters::default();
        let mut session = ModelSession::new(CountingFactory {
            counters,
            hands_per_frame: 1,
            fail: true,
        });

        let err = session.create_or_switch(OperatingMode::Stream).unwrap_err();
        assert!(matches!(err, TrackerError::ModelUnavailable(_)));
        assert!(err.is_fatal_for_stream());
        assert_eq!(session.mode(), None);
    }
}
