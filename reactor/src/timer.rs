//! Timer bookkeeping for the timer queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Process-wide timer counter; sequences are never reused, so a sequence
/// number alone identifies a timer unambiguously.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

impl TimerId {
    pub(crate) fn new(sequence: u64) -> TimerId {
        TimerId { sequence }
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }
}

pub(crate) struct Timer {
    callback: TimerCallback,
    expiration: Instant,
    /// `None` makes the timer one-shot.
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(
        callback: TimerCallback,
        expiration: Instant,
        interval: Option<Duration>,
    ) -> Timer {
        Timer {
            callback,
            expiration,
            interval,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub(crate) fn run(&self) {
        (self.callback)();
    }

    pub(crate) fn expiration(&self) -> Instant {
        self.expiration
    }

    pub(crate) fn repeat(&self) -> bool {
        self.interval.is_some()
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Advance to the next expiration. Anchoring on the previous expiration
    /// instead of `now` keeps a repeating timer from drifting when its
    /// callback runs slowly.
    pub(crate) fn restart(&mut self) {
        let interval = self.interval.expect("restarting a one-shot timer");
        self.expiration += interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequences_are_unique_and_increasing() {
        let cb: TimerCallback = Arc::new(|| {});
        let a = Timer::new(cb.clone(), Instant::now(), None);
        let b = Timer::new(cb, Instant::now(), None);
        assert!(b.sequence() > a.sequence());
    }

    #[test]
    fn test_restart_anchors_on_previous_expiration() {
        let cb: TimerCallback = Arc::new(|| {});
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let mut timer = Timer::new(cb, start, Some(interval));

        timer.restart();
        timer.restart();
        assert_eq!(timer.expiration(), start + 2 * interval);
    }

    #[test]
    #[should_panic(expected = "restarting a one-shot timer")]
    fn test_restart_one_shot_panics() {
        let cb: TimerCallback = Arc::new(|| {});
        let mut timer = Timer::new(cb, Instant::now(), None);
        timer.restart();
    }
}
