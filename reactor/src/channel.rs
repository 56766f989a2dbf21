//! Binding from a file descriptor to its event mask and handlers.
//!
//! A channel never owns its descriptor; the owning object (connection,
//! acceptor, timer queue, or the loop's wakeup counter) controls the fd
//! lifetime and tears the channel down before closing it. Each fd has at
//! most one channel, and all mutation happens on the owning loop's thread.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::event_loop::EventLoop;

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 =
    (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;
const CLOSE_EVENT: u32 = libc::EPOLLHUP as u32;
const ERROR_EVENT: u32 = libc::EPOLLERR as u32;

/// Registration state as tracked by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    /// Never registered, or fully removed.
    New,
    /// Present in the fd map and registered with the kernel.
    Added,
    /// Present in the fd map but deregistered (no requested events).
    Deleted,
}

pub type ReadEventCallback = Arc<dyn Fn(Instant) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
    read: Option<ReadEventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

pub struct Channel {
    fd: RawFd,
    owner_loop: Weak<EventLoop>,
    self_weak: Weak<Channel>,
    /// Requested epoll event mask.
    events: AtomicU32,
    /// Event mask most recently returned by the poller.
    revents: AtomicU32,
    poller_state: AtomicU8,
    event_handling: AtomicBool,
    added_to_loop: AtomicBool,
    tied: AtomicBool,
    /// Liveness witness to the owning object. Upgraded before dispatch so an
    /// event reported for an fd whose owner is mid-destruction is skipped.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    handlers: Mutex<Handlers>,
}

impl Channel {
    pub fn new(owner_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_weak| Channel {
            fd,
            owner_loop,
            self_weak: self_weak.clone(),
            events: AtomicU32::new(NONE_EVENT),
            revents: AtomicU32::new(NONE_EVENT),
            poller_state: AtomicU8::new(PollerState::New as u8),
            event_handling: AtomicBool::new(false),
            added_to_loop: AtomicBool::new(false),
            tied: AtomicBool::new(false),
            tie: Mutex::new(None),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_read_callback(&self, callback: ReadEventCallback) {
        self.handlers.lock().read = Some(callback);
    }

    pub fn set_write_callback(&self, callback: EventCallback) {
        self.handlers.lock().write = Some(callback);
    }

    pub fn set_close_callback(&self, callback: EventCallback) {
        self.handlers.lock().close = Some(callback);
    }

    pub fn set_error_callback(&self, callback: EventCallback) {
        self.handlers.lock().error = Some(callback);
    }

    /// Install the liveness witness. Must be called once the owning object is
    /// behind an `Arc`, before the first event can be delivered for it.
    pub fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        let witness: Weak<dyn Any + Send + Sync> = Arc::downgrade(&owner);
        *self.tie.lock() = Some(witness);
        self.tied.store(true, Ordering::SeqCst);
    }

    pub fn enable_reading(&self) {
        self.events.fetch_or(READ_EVENT, Ordering::SeqCst);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.events.fetch_and(!READ_EVENT, Ordering::SeqCst);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.events.fetch_or(WRITE_EVENT, Ordering::SeqCst);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::SeqCst);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.store(NONE_EVENT, Ordering::SeqCst);
        self.update();
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.events.load(Ordering::SeqCst) & READ_EVENT != 0
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.events.load(Ordering::SeqCst) & WRITE_EVENT != 0
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.events.load(Ordering::SeqCst) == NONE_EVENT
    }

    pub(crate) fn requested_events(&self) -> u32 {
        self.events.load(Ordering::SeqCst)
    }

    pub(crate) fn set_returned_events(&self, revents: u32) {
        self.revents.store(revents, Ordering::SeqCst);
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        match self.poller_state.load(Ordering::SeqCst) {
            0 => PollerState::New,
            1 => PollerState::Added,
            _ => PollerState::Deleted,
        }
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.poller_state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn added_to_loop(&self) -> bool {
        self.added_to_loop.load(Ordering::SeqCst)
    }

    pub(crate) fn owner_loop_ptr(&self) -> *const EventLoop {
        self.owner_loop.as_ptr()
    }

    fn update(&self) {
        self.added_to_loop.store(true, Ordering::SeqCst);
        let (Some(owner), Some(this)) = (self.owner_loop.upgrade(), self.self_weak.upgrade())
        else {
            trace!(fd = self.fd, "update on channel whose loop is gone");
            return;
        };
        owner.update_channel(&this);
    }

    /// Deregister from the loop. The requested mask must already be empty.
    pub fn remove(&self) {
        assert!(self.is_none_event(), "removing channel with live interest");
        self.added_to_loop.store(false, Ordering::SeqCst);
        if let Some(owner) = self.owner_loop.upgrade() {
            owner.remove_channel(self);
        }
    }

    /// Dispatch the events reported by the last poll.
    ///
    /// When tied, the witness is upgraded first; if the owning object is
    /// already destroyed every handler is skipped for this event.
    pub fn handle_event(&self, receive_time: Instant) {
        if self.tied.load(Ordering::SeqCst) {
            let guard = self.tie.lock().as_ref().and_then(Weak::upgrade);
            match guard {
                Some(_guard) => self.handle_event_with_guard(receive_time),
                None => trace!(fd = self.fd, "owner destroyed, skipping event"),
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        self.event_handling.store(true, Ordering::SeqCst);
        let revents = self.revents.load(Ordering::SeqCst);
        trace!(fd = self.fd, events = %events_to_string(revents), "handle event");

        // Clone the handlers out so user callbacks never run under the slot
        // lock; a read handler is free to replace the write handler.
        let (read, write, close, error) = {
            let handlers = self.handlers.lock();
            (
                handlers.read.clone(),
                handlers.write.clone(),
                handlers.close.clone(),
                handlers.error.clone(),
            )
        };

        if revents & READ_EVENT != 0
            && let Some(callback) = read
        {
            callback(receive_time);
        }
        if revents & WRITE_EVENT != 0
            && let Some(callback) = write
        {
            callback();
        }
        // Drain before close: hangup with readable data still pending is
        // delivered to the read handler above, not here.
        if revents & CLOSE_EVENT != 0
            && revents & libc::EPOLLIN as u32 == 0
            && let Some(callback) = close
        {
            callback();
        }
        if revents & ERROR_EVENT != 0
            && let Some(callback) = error
        {
            callback();
        }
        self.event_handling.store(false, Ordering::SeqCst);
    }
}

/// Render an epoll event mask for trace output.
pub(crate) fn events_to_string(events: u32) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (libc::EPOLLIN as u32, "IN"),
        (libc::EPOLLPRI as u32, "PRI"),
        (libc::EPOLLOUT as u32, "OUT"),
        (libc::EPOLLHUP as u32, "HUP"),
        (libc::EPOLLRDHUP as u32, "RDHUP"),
        (libc::EPOLLERR as u32, "ERR"),
    ] {
        if events & bit != 0 {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_channel() -> Arc<Channel> {
        // A dead loop reference: mask bookkeeping still works, registration
        // becomes a no-op.
        Channel::new(Weak::new(), -1)
    }

    #[test]
    fn test_interest_mask_transitions() {
        let channel = detached_channel();
        assert!(channel.is_none_event());

        channel.enable_reading();
        assert!(channel.is_reading());
        assert!(!channel.is_writing());

        channel.enable_writing();
        assert!(channel.is_reading());
        assert!(channel.is_writing());

        channel.disable_writing();
        assert!(!channel.is_writing());

        channel.disable_all();
        assert!(channel.is_none_event());
    }

    #[test]
    fn test_dispatch_skipped_when_tie_dead() {
        let channel = detached_channel();
        let fired = Arc::new(AtomicBool::new(false));

        let fired_clone = fired.clone();
        channel.set_read_callback(Arc::new(move |_| {
            fired_clone.store(true, Ordering::SeqCst);
        }));

        let owner = Arc::new(());
        channel.tie(&owner);
        drop(owner);

        channel.set_returned_events(READ_EVENT);
        channel.handle_event(Instant::now());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_close_not_dispatched_while_readable() {
        let channel = detached_channel();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        channel.set_read_callback(Arc::new(move |_| o.lock().push("read")));
        let o = order.clone();
        channel.set_close_callback(Arc::new(move || o.lock().push("close")));

        // HUP together with IN: the read handler drains, close waits.
        channel.set_returned_events(CLOSE_EVENT | libc::EPOLLIN as u32);
        channel.handle_event(Instant::now());
        assert_eq!(*order.lock(), vec!["read"]);

        // HUP alone now reaches the close handler.
        channel.set_returned_events(CLOSE_EVENT);
        channel.handle_event(Instant::now());
        assert_eq!(*order.lock(), vec!["read", "close"]);
    }

    #[test]
    fn test_events_to_string() {
        let s = events_to_string(READ_EVENT | WRITE_EVENT);
        assert!(s.contains("IN"));
        assert!(s.contains("OUT"));
    }
}
