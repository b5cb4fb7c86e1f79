//! Cooperative tick scheduling for the stream path.
//!
//! A [`RepeatingTask`] runs one tick at a time on a worker thread. When the next tick happens is
//! decided by a [`TickDriver`]: either a fixed refresh interval or the host's own per-frame
//! callback through [`HostTicker`]. [`FrameScheduler`] decides what a tick does with the frame it
//! finds.

use std::{
    num::NonZeroU32,
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, select};

/// Creates a connected cancellation pair.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let flag = Arc::new(AtomicBool::new(false));
    // Nothing is ever sent; dropping the sender is the wake-up signal.
    let (tx, rx) = bounded::<()>(0);
    (
        CancelHandle {
            flag: flag.clone(),
            signal: Some(tx),
        },
        CancelToken { flag, signal: rx },
    )
}

#[derive(Debug)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    signal: Option<Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
        self.signal.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Becomes disconnected once the paired handle cancels.
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }
}

/// Source of tick boundaries.
pub trait TickDriver: Send + 'static {
    /// Blocks until the next tick is due. Returns `false` once no further tick will come.
    fn wait_next(&mut self, cancel: &CancelToken) -> bool;
}

/// Ticks at a fixed interval, like a display refresh.
#[derive(Debug)]
pub struct IntervalDriver {
    interval: Duration,
    next_due: Option<Instant>,
}

impl IntervalDriver {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }
}

impl TickDriver for IntervalDriver {
    fn wait_next(&mut self, cancel: &CancelToken) -> bool {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        // Skip missed deadlines instead of bursting to catch up.
        self.next_due = Some(due.max(now) + self.interval);

        let wait = due.saturating_duration_since(now);
        if wait.is_zero() {
            return !cancel.is_cancelled();
        }
        match cancel.signal().recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => !cancel.is_cancelled(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// Creates a host-driven tick source.
///
/// The host keeps the [`HostTicker`] and calls it from its per-frame callback; the
/// [`HostTickDriver`] goes to [`RepeatingTask::start`]. Ticks are handed over through a
/// rendezvous channel, so a tick is only accepted once the previous one has finished.
pub fn host_ticks() -> (HostTicker, HostTickDriver) {
    let (tx, rx) = bounded(0);
    (HostTicker { ticks: tx }, HostTickDriver { ticks: rx })
}

#[derive(Clone, Debug)]
pub struct HostTicker {
    ticks: Sender<()>,
}

impl HostTicker {
    /// Blocks until the worker takes the tick. Returns `false` if the worker is gone.
    pub fn tick(&self) -> bool {
        self.ticks.send(()).is_ok()
    }

    /// Hands over a tick only if the worker is idle right now.
    pub fn try_tick(&self) -> bool {
        match self.ticks.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => false,
        }
    }
}

#[derive(Debug)]
pub struct HostTickDriver {
    ticks: Receiver<()>,
}

impl TickDriver for HostTickDriver {
    fn wait_next(&mut self, cancel: &CancelToken) -> bool {
        select! {
            recv(self.ticks) -> tick => tick.is_ok() && !cancel.is_cancelled(),
            recv(cancel.signal()) -> _ => false,
        }
    }
}

/// A cancellable repeating task. Ticks never overlap.
#[derive(Debug)]
pub struct RepeatingTask {
    cancel: CancelHandle,
    handle: Option<thread::JoinHandle<()>>,
}

impl RepeatingTask {
    pub fn start<D, F>(mut driver: D, mut tick: F) -> Self
    where
        D: TickDriver,
        F: FnMut(&CancelToken) -> ControlFlow<()> + Send + 'static,
    {
        let (cancel, token) = cancellation();

        let handle = thread::spawn(move || {
            while !token.is_cancelled() {
                if !driver.wait_next(&token) || token.is_cancelled() {
                    break;
                }
                if tick(&token).is_break() {
                    log::debug!("repeating task finished on its own");
                    break;
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancels the task and waits for an in-flight tick to finish.
    pub fn cancel(mut self) {
        self.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("repeating task panicked");
            }
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Same presentation timestamp as the last frame seen; nothing new to look at.
    Duplicate,
    /// New frame, dropped by the frame-skip policy.
    Skipped,
    Process,
}

/// Dedup and frame-skip bookkeeping for the stream loop.
#[derive(Clone, Debug)]
pub struct FrameScheduler {
    skip_interval: NonZeroU32,
    last_timestamp: Option<Duration>,
    frame_counter: u64,
}

impl FrameScheduler {
    pub fn new(skip_interval: NonZeroU32) -> Self {
        Self {
            skip_interval,
            last_timestamp: None,
            frame_counter: 0,
        }
    }

    pub fn admit(&mut self, timestamp: Duration) -> Admission {
        if self.last_timestamp == Some(timestamp) {
            return Admission::Duplicate;
        }
        self.last_timestamp = Some(timestamp);
        self.frame_counter += 1;

        if self.frame_counter % u64::from(self.skip_interval.get()) == 0 {
            Admission::Process
        } else {
            Admission::Skipped
        }
    }

    pub fn reset(&mut self) {
        self.last_timestamp = None;
        self.frame_counter = 0;
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn last_timestamp(&self) -> Option<Duration> {
        self.last_timestamp
    }

    pub fn skip_interval(&self) -> NonZeroU32 {
        self.skip_interval
    }
}
