use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use crate::callbacks::TimerCallback;
use crate::event_loop::EventLoop;
use crate::sys::timerfd::TimerFd;
use crate::timer::{Timer, TimerId};

/// Floor for arming the timerfd; a zero relative value would disarm it.
const MIN_ARM_DELAY: Duration = Duration::from_micros(100);

struct Indexes {
    /// Primary order: (expiration, sequence), so simultaneous timers stay
    /// distinguishable and fire in creation order.
    timers: BTreeMap<(Instant, u64), Timer>,
    /// Sequence to expiration, for cancellation lookup. Always the same
    /// size as `timers` at a quiescent point.
    active: HashMap<u64, Instant>,
    /// Timers cancelled while their callbacks were being invoked; these
    /// must not be rescheduled.
    canceling: HashSet<u64>,
    calling_expired: bool,
}

/// An ordered set of timers multiplexed onto one kernel timer descriptor.
///
/// The timerfd is always armed to the earliest entry's expiration, so timed
/// work and I/O share one wait point. All mutation happens on the owning
/// loop's thread; `add_timer` and `cancel` marshal themselves there.
pub(crate) struct TimerQueue {
    event_loop: Weak<EventLoop>,
    timer_fd: TimerFd,
    indexes: Mutex<Indexes>,
}

impl TimerQueue {
    pub fn new(event_loop: Weak<EventLoop>, timer_fd: TimerFd) -> TimerQueue {
        TimerQueue {
            event_loop,
            timer_fd,
            indexes: Mutex::new(Indexes {
                timers: BTreeMap::new(),
                active: HashMap::new(),
                canceling: HashSet::new(),
                calling_expired: false,
            }),
        }
    }

    /// Safe from any thread; the insertion itself runs on the owning loop.
    pub fn add_timer(&self, callback: TimerCallback, when: Instant, interval: Duration) -> TimerId {
        let timer = Timer::new(callback, when, interval);
        let id = TimerId::new(timer.sequence());

        if let Some(event_loop) = self.event_loop.upgrade() {
            let weak = self.event_loop.clone();
            event_loop.run_in_loop(move || {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.timer_queue().add_timer_in_loop(timer);
                }
            });
        }

        id
    }

    /// Safe from any thread. Precise even mid-callback: a repeating timer
    /// cancelled from inside its own callback is not rescheduled.
    pub fn cancel(&self, id: TimerId) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            let weak = self.event_loop.clone();
            event_loop.run_in_loop(move || {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.timer_queue().cancel_in_loop(id);
                }
            });
        }
    }

    fn add_timer_in_loop(&self, timer: Timer) {
        self.assert_in_loop_thread();
        let earliest_changed = {
            let mut indexes = self.indexes.lock().unwrap();
            let changed = Self::insert(&mut indexes, timer);
            assert_eq!(indexes.timers.len(), indexes.active.len());
            changed
        };

        if let Some(when) = earliest_changed {
            self.arm(when);
        }
    }

    fn cancel_in_loop(&self, id: TimerId) {
        self.assert_in_loop_thread();
        let mut indexes = self.indexes.lock().unwrap();
        assert_eq!(indexes.timers.len(), indexes.active.len());

        if let Some(expiration) = indexes.active.remove(&id.sequence()) {
            let removed = indexes.timers.remove(&(expiration, id.sequence()));
            assert!(removed.is_some());
        } else if indexes.calling_expired {
            indexes.canceling.insert(id.sequence());
        }

        assert_eq!(indexes.timers.len(), indexes.active.len());
    }

    /// Read callback of the timerfd channel.
    pub fn handle_read(&self) {
        self.assert_in_loop_thread();
        let now = Instant::now();

        match self.timer_fd.read() {
            Ok(count) => log::trace!("TimerQueue::handle_read {} expirations", count),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                log::trace!("TimerQueue::handle_read spurious wakeup")
            }
            Err(e) => log::error!("TimerQueue::handle_read: {}", e),
        }

        let mut expired = {
            let mut indexes = self.indexes.lock().unwrap();
            indexes.calling_expired = true;
            indexes.canceling.clear();
            Self::get_expired(&mut indexes, now)
        };

        // callbacks run outside the indexes so they may add or cancel
        // timers freely
        for timer in expired.iter_mut() {
            timer.run();
        }

        let next = {
            let mut indexes = self.indexes.lock().unwrap();
            indexes.calling_expired = false;

            for mut timer in expired {
                if timer.repeat() && !indexes.canceling.contains(&timer.sequence()) {
                    timer.restart(now);
                    Self::insert(&mut indexes, timer);
                }
            }

            assert_eq!(indexes.timers.len(), indexes.active.len());
            indexes.timers.keys().next().map(|&(when, _)| when)
        };

        if let Some(when) = next {
            self.arm(when);
        }
    }

    /// Removes and returns every entry due at or before `now`, in firing
    /// order.
    fn get_expired(indexes: &mut Indexes, now: Instant) -> Vec<Timer> {
        let remaining = indexes.timers.split_off(&(now, u64::MAX));
        let due = mem::replace(&mut indexes.timers, remaining);

        let mut expired = Vec::with_capacity(due.len());
        for ((_, sequence), timer) in due {
            let removed = indexes.active.remove(&sequence);
            assert!(removed.is_some());
            expired.push(timer);
        }

        assert_eq!(indexes.timers.len(), indexes.active.len());
        expired
    }

    /// Inserts, returning the new expiration when it became the earliest.
    fn insert(indexes: &mut Indexes, timer: Timer) -> Option<Instant> {
        let when = timer.expiration();
        let sequence = timer.sequence();

        let earliest_changed = match indexes.timers.keys().next() {
            Some(&(first, _)) => when < first,
            None => true,
        };

        let previous = indexes.timers.insert((when, sequence), timer);
        assert!(previous.is_none());
        let previous = indexes.active.insert(sequence, when);
        assert!(previous.is_none());

        earliest_changed.then_some(when)
    }

    fn arm(&self, expiration: Instant) {
        let mut delay = expiration.saturating_duration_since(Instant::now());
        if delay < MIN_ARM_DELAY {
            delay = MIN_ARM_DELAY;
        }

        if let Err(e) = self.timer_fd.set_relative(delay) {
            log::error!("TimerQueue: timerfd_settime: {}", e);
        }
    }

    fn assert_in_loop_thread(&self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.assert_in_loop_thread();
        }
    }
}
