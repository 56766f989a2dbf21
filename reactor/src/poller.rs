//! Thin readiness demultiplexer over level-triggered epoll.
//!
//! The poller tracks one channel per fd and keeps the kernel registration
//! in sync with each channel's requested mask. Every method runs on the
//! owning loop's thread; the poller itself performs no locking.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, trace};

use crate::channel::{Channel, PollerState, events_to_string};

const INITIAL_EVENT_CAPACITY: usize = 16;
const MAX_EVENT_CAPACITY: usize = 65536;

pub struct Poller {
    epoll_fd: OwnedFd,
    /// Kernel-filled event array; capacity doubles when a wait saturates it.
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>, ahash::RandomState>,
}

impl Poller {
    pub fn new() -> Poller {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            error!(%err, "epoll_create1 failed");
            panic!("epoll_create1 failed: {err}");
        }
        Poller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: Vec::with_capacity(INITIAL_EVENT_CAPACITY),
            channels: HashMap::default(),
        }
    }

    /// Wait up to `timeout_ms` (-1 = indefinitely) and collect the channels
    /// with returned events into `active`, in kernel order. Returns the
    /// post-wake timestamp used for receive-time accounting.
    pub fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.capacity() as libc::c_int,
                    timeout_ms,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            error!(%err, "epoll_wait failed");
            panic!("epoll_wait failed: {err}");
        };
        let receive_time = Instant::now();

        // The kernel initialized the first `n` entries.
        unsafe { self.events.set_len(n) };

        if n == 0 {
            trace!("nothing happened");
            return receive_time;
        }

        trace!(count = n, "events ready");
        for event in &self.events {
            let fd = event.u64 as RawFd;
            match self.channels.get(&fd) {
                Some(channel) => {
                    channel.set_returned_events(event.events);
                    active.push(channel.clone());
                }
                None => trace!(fd, "event for unknown fd"),
            }
        }

        if n == self.events.capacity() && self.events.capacity() < MAX_EVENT_CAPACITY {
            self.events.reserve_exact(self.events.capacity());
        }
        receive_time
    }

    /// Register, modify, or deregister based on the channel's requested
    /// events and state tag. A channel that requests nothing is deregistered
    /// but stays in the fd map until [`remove_channel`](Self::remove_channel).
    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.poller_state();
        let fd = channel.fd();
        trace!(
            fd,
            events = %events_to_string(channel.requested_events()),
            ?state,
            "update channel"
        );
        match state {
            PollerState::New | PollerState::Deleted => {
                if state == PollerState::New {
                    assert!(
                        !self.channels.contains_key(&fd),
                        "fd {fd} already has a channel"
                    );
                    self.channels.insert(fd, channel.clone());
                } else {
                    assert!(self.owns(channel), "updating unowned channel fd {fd}");
                }
                channel.set_poller_state(PollerState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            PollerState::Added => {
                assert!(self.owns(channel), "updating unowned channel fd {fd}");
                if channel.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_poller_state(PollerState::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    /// Drop the fd map entry. Requires an empty requested mask and a channel
    /// that is registered or deregistered-but-tracked.
    pub fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!(fd, "remove channel");
        assert!(
            self.channels.contains_key(&fd),
            "removing unowned channel fd {fd}"
        );
        assert!(channel.is_none_event(), "removing channel with live interest");
        let state = channel.poller_state();
        assert!(
            state == PollerState::Added || state == PollerState::Deleted,
            "removing channel in state {state:?}"
        );
        self.channels.remove(&fd);
        if state == PollerState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_poller_state(PollerState::New);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
    }

    fn owns(&self, channel: &Channel) -> bool {
        self.has_channel(channel)
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.requested_events(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) } < 0 {
            // A stale fd here means the owner closed it before tearing down
            // the channel; that ordering violation is unrecoverable.
            let err = io::Error::last_os_error();
            error!(op, fd, %err, "epoll_ctl failed");
            panic!("epoll_ctl op={op} fd={fd} failed: {err}");
        }
    }
}
