//! Ordered timer set driven by a monotonic timer fd.
//!
//! Two mirrored indices cover the two access paths: a `BTreeMap` keyed by
//! `(expiration, sequence)` for harvesting expired timers in deterministic
//! order, and a sequence-to-expiration map for O(log n) cancellation by id.
//! Repetition is library-driven: the kernel timer is always armed one-shot
//! to the earliest pending expiration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket;
use crate::timer::{Timer, TimerCallback, TimerId};

/// Arming floor. Re-arming below this would under-arm when several timers
/// expire near-simultaneously and the earliest has already passed.
const MIN_ARM_DELAY: Duration = Duration::from_micros(100);

struct TimerSets {
    by_expiration: BTreeMap<(Instant, u64), Timer>,
    by_sequence: HashMap<u64, Instant, ahash::RandomState>,
    /// Scratch for the timers harvested by one timer-fd event.
    expired: Vec<Timer>,
    calling_expired_timers: bool,
    /// Sequences cancelled from within their own firing round.
    cancelled_while_firing: HashSet<u64, ahash::RandomState>,
}

pub struct TimerQueue {
    owner_loop: Weak<EventLoop>,
    timer_fd: OwnedFd,
    timer_channel: Arc<Channel>,
    sets: Mutex<TimerSets>,
}

impl TimerQueue {
    pub(crate) fn new(owner_loop: Weak<EventLoop>) -> Arc<TimerQueue> {
        let timer_fd = socket::create_timer_fd();
        let timer_channel = Channel::new(owner_loop.clone(), timer_fd.as_raw_fd());
        Arc::new(TimerQueue {
            owner_loop,
            timer_fd,
            timer_channel,
            sets: Mutex::new(TimerSets {
                by_expiration: BTreeMap::new(),
                by_sequence: HashMap::default(),
                expired: Vec::new(),
                calling_expired_timers: false,
                cancelled_while_firing: HashSet::default(),
            }),
        })
    }

    /// Register the timer-fd channel with the owning loop. Called once by
    /// `EventLoop::new` after the loop is behind its `Arc`.
    pub(crate) fn register(self: &Arc<Self>) {
        let queue = Arc::downgrade(self);
        self.timer_channel.set_read_callback(Arc::new(move |_| {
            if let Some(queue) = queue.upgrade() {
                queue.handle_expired();
            }
        }));
        self.timer_channel.enable_reading();
    }

    /// Schedule `callback` at `expiration`, repeating at `interval` when set.
    /// Safe to call from any thread; the insertion happens on the loop
    /// thread.
    pub(crate) fn add_timer(
        self: &Arc<Self>,
        callback: TimerCallback,
        expiration: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let timer = Timer::new(callback, expiration, interval);
        let id = TimerId::new(timer.sequence());
        let owner = self
            .owner_loop
            .upgrade()
            .expect("adding timer to a destroyed loop");
        let queue = Arc::clone(self);
        owner.run_in_loop(move || queue.add_timer_in_loop(timer));
        id
    }

    /// Cancel by id. A repeating timer cancelled from inside its own
    /// callback is recorded and not reinserted after the firing round.
    pub(crate) fn cancel(self: &Arc<Self>, id: TimerId) {
        let Some(owner) = self.owner_loop.upgrade() else {
            return;
        };
        let queue = Arc::clone(self);
        owner.run_in_loop(move || queue.cancel_in_loop(id));
    }

    fn add_timer_in_loop(&self, timer: Timer) {
        self.assert_in_loop_thread();
        let expiration = timer.expiration();
        let earliest_changed = {
            let mut sets = self.sets.lock();
            insert_locked(&mut sets, timer)
        };
        if earliest_changed {
            self.arm(expiration);
        }
    }

    fn cancel_in_loop(&self, id: TimerId) {
        self.assert_in_loop_thread();
        let sequence = id.sequence();
        let mut sets = self.sets.lock();
        if let Some(expiration) = sets.by_sequence.remove(&sequence) {
            let removed = sets.by_expiration.remove(&(expiration, sequence));
            debug_assert!(removed.is_some(), "timer indices out of sync");
            trace!(sequence, "timer cancelled");
        } else if sets.calling_expired_timers {
            sets.cancelled_while_firing.insert(sequence);
            trace!(sequence, "timer cancelled while firing");
        }
    }

    /// Timer-fd readable: harvest everything due, fire, then reinsert the
    /// surviving repeating timers and re-arm.
    fn handle_expired(&self) {
        self.assert_in_loop_thread();
        let now = Instant::now();
        self.read_timer_fd();

        let mut expired = {
            let mut sets = self.sets.lock();
            sets.calling_expired_timers = true;
            sets.cancelled_while_firing.clear();

            // Everything strictly after `now` stays; the rest fires. The
            // u64::MAX sentinel keeps timers expiring exactly at `now` on
            // the firing side.
            let remaining = sets.by_expiration.split_off(&(now, u64::MAX));
            let due = mem::replace(&mut sets.by_expiration, remaining);

            let mut expired = mem::take(&mut sets.expired);
            expired.clear();
            for (_, timer) in due {
                sets.by_sequence.remove(&timer.sequence());
                expired.push(timer);
            }
            expired
        };

        trace!(count = expired.len(), "timers expired");
        for timer in &expired {
            timer.run();
        }

        let next = {
            let mut sets = self.sets.lock();
            sets.calling_expired_timers = false;
            for mut timer in expired.drain(..) {
                if timer.repeat() && !sets.cancelled_while_firing.contains(&timer.sequence()) {
                    timer.restart();
                    insert_locked(&mut sets, timer);
                }
            }
            sets.cancelled_while_firing.clear();
            sets.expired = expired;
            sets.by_expiration.keys().next().map(|(when, _)| *when)
        };
        if let Some(when) = next {
            self.arm(when);
        }
    }

    /// Drain the expiration counter. The value is discarded; the ordered set
    /// is authoritative for what actually fires.
    fn read_timer_fd(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.timer_fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            warn!(bytes = n, "short read from timer fd");
        }
    }

    /// Re-arm the kernel timer relative to now, clamped to the floor.
    fn arm(&self, expiration: Instant) {
        let delay = expiration
            .saturating_duration_since(Instant::now())
            .max(MIN_ARM_DELAY);
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        let ret = unsafe {
            libc::timerfd_settime(self.timer_fd.as_raw_fd(), 0, &new_value, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            error!(%err, "timerfd_settime failed");
            panic!("timerfd_settime failed: {err}");
        }
    }

    fn assert_in_loop_thread(&self) {
        if let Some(owner) = self.owner_loop.upgrade() {
            owner.assert_in_loop_thread();
        }
    }
}

/// Insert into both indices. Returns true when the new timer became the
/// earliest, meaning the kernel timer must be re-armed.
fn insert_locked(sets: &mut TimerSets, timer: Timer) -> bool {
    let expiration = timer.expiration();
    let sequence = timer.sequence();
    let earliest_changed = sets
        .by_expiration
        .keys()
        .next()
        .is_none_or(|(first, _)| expiration < *first);
    let previous = sets.by_sequence.insert(sequence, expiration);
    debug_assert!(previous.is_none(), "duplicate timer sequence");
    sets.by_expiration.insert((expiration, sequence), timer);
    earliest_changed
}
