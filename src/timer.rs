use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::callbacks::TimerCallback;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Opaque handle for cancelling a scheduled timer.
///
/// The sequence is drawn from a global monotone counter, so an id never
/// aliases a later timer.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
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
    interval: Duration,
    repeat: bool,
    sequence: u64,
}

impl Timer {
    pub fn new(callback: TimerCallback, when: Instant, interval: Duration) -> Timer {
        Timer {
            callback,
            expiration: when,
            interval,
            repeat: interval > Duration::ZERO,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub fn run(&mut self) {
        (self.callback)();
    }

    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Reschedules a repeating timer relative to `now`; the interval is a
    /// minimum spacing, not a phase.
    pub fn restart(&mut self, now: Instant) {
        self.expiration = now + self.interval;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequences_are_unique_and_increasing() {
        let a = Timer::new(Box::new(|| {}), Instant::now(), Duration::ZERO);
        let b = Timer::new(Box::new(|| {}), Instant::now(), Duration::ZERO);
        assert!(b.sequence() > a.sequence());
    }

    #[test]
    fn restart_spaces_from_now() {
        let start = Instant::now();
        let mut timer = Timer::new(Box::new(|| {}), start, Duration::from_millis(20));
        assert!(timer.repeat());

        let later = start + Duration::from_millis(75);
        timer.restart(later);
        assert_eq!(timer.expiration(), later + Duration::from_millis(20));
    }
}
