//! Stall detection and cooperative cancellation.
//!
//! A running strategy pushes `bytes_written` observations into a
//! [`ProgressSink`]; the [`StallDetector`] watchdog watches the sink and
//! trips the attempt's cancellation flag when no progress arrives within the
//! threshold. Cancellation is never a kill: strategies poll the flag at
//! chunk/segment boundaries, finish their in-flight I/O, checkpoint, and
//! return.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::FetchFailure;

/// Process-wide cancellation flag, set by the SIGINT handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Stalled,
    Interrupted,
}

impl CancelReason {
    pub fn into_failure(self) -> FetchFailure {
        match self {
            CancelReason::Stalled => FetchFailure::stalled(),
            CancelReason::Interrupted => FetchFailure::interrupted(),
        }
    }
}

/// Per-attempt cancellation: the stall watchdog trips `stalled`, the global
/// flag carries process interruption. Interruption wins when both are set.
#[derive(Debug, Clone)]
pub struct AttemptCancel {
    global: CancelFlag,
    stalled: Arc<AtomicBool>,
}

impl AttemptCancel {
    pub fn new(global: CancelFlag) -> Self {
        Self {
            global,
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trip_stalled(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn check(&self) -> Option<CancelReason> {
        if self.global.is_cancelled() {
            return Some(CancelReason::Interrupted);
        }
        if self.stalled.load(Ordering::SeqCst) {
            return Some(CancelReason::Stalled);
        }
        None
    }
}

/// Monotonic progress observations from a running strategy.
#[derive(Debug)]
pub struct ProgressSink {
    bytes: AtomicU64,
    last_progress: Mutex<Instant>,
}

impl ProgressSink {
    pub fn new(initial_bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(initial_bytes),
            last_progress: Mutex::new(Instant::now()),
        }
    }

    /// Record the current total of bytes written. Only increases count as
    /// progress.
    pub fn record(&self, total_bytes: u64) {
        let previous = self.bytes.fetch_max(total_bytes, Ordering::SeqCst);
        if total_bytes > previous {
            *self.last_progress.lock().expect("progress clock poisoned") = Instant::now();
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_progress
            .lock()
            .expect("progress clock poisoned")
            .elapsed()
    }
}

/// Watchdog task for one strategy attempt.
pub struct StallDetector {
    handle: JoinHandle<()>,
}

impl StallDetector {
    pub fn spawn(sink: Arc<ProgressSink>, cancel: AttemptCancel, threshold: Duration) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if cancel.check().is_some() {
                    return;
                }
                if sink.idle_for() >= threshold {
                    cancel.trip_stalled();
                    return;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for StallDetector {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn watchdog_trips_after_idle_threshold() {
        let sink = Arc::new(ProgressSink::new(0));
        let cancel = AttemptCancel::new(CancelFlag::new());
        let _detector = StallDetector::spawn(
            Arc::clone(&sink),
            cancel.clone(),
            Duration::from_secs(5),
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cancel.check(), None);

        sink.record(100);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(cancel.check(), None, "progress reset the idle clock");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cancel.check(), Some(CancelReason::Stalled));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_progress_keeps_attempt_alive() {
        let sink = Arc::new(ProgressSink::new(0));
        let cancel = AttemptCancel::new(CancelFlag::new());
        let _detector = StallDetector::spawn(
            Arc::clone(&sink),
            cancel.clone(),
            Duration::from_secs(2),
        );

        for i in 1..=10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            sink.record(i * 10);
        }
        assert_eq!(cancel.check(), None);
    }

    #[test]
    fn interruption_wins_over_stall() {
        let global = CancelFlag::new();
        let cancel = AttemptCancel::new(global.clone());
        cancel.trip_stalled();
        assert_eq!(cancel.check(), Some(CancelReason::Stalled));

        global.cancel();
        assert_eq!(cancel.check(), Some(CancelReason::Interrupted));
    }

    #[test]
    fn record_ignores_regressions() {
        let sink = ProgressSink::new(100);
        sink.record(50);
        assert_eq!(sink.bytes(), 100);
        sink.record(150);
        assert_eq!(sink.bytes(), 150);
    }
}
