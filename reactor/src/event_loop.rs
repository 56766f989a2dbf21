//! Per-thread reactor: poll, dispatch, run posted tasks.
//!
//! Exactly one loop may exist per OS thread, and every mutation of
//! loop-owned state (channels, poller entries, connection buffers) happens
//! on that thread. Other threads communicate by posting tasks; an eventfd
//! breaks the blocking poll so a posted task is picked up no later than the
//! next cycle.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::socket;
use crate::timer::{TimerCallback, TimerId};
use crate::timer_queue::TimerQueue;

thread_local! {
    /// The loop constructed on this thread, if any. A dead weak counts as
    /// vacant, so a destroyed loop frees its slot without coordination.
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

type Task = Box<dyn FnOnce() + Send>;

pub struct EventLoop {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending_tasks: AtomicBool,
    poller: Mutex<Poller>,
    timer_queue: Arc<TimerQueue>,
    wakeup_fd: OwnedFd,
    wakeup_channel: Arc<Channel>,
    pending_tasks: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Create the loop for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a live loop, or if the kernel
    /// refuses the epoll/eventfd/timerfd descriptors.
    pub fn new() -> Arc<EventLoop> {
        socket::ignore_sigpipe();

        CURRENT_LOOP.with(|slot| {
            if slot.borrow().upgrade().is_some() {
                error!(thread = ?thread::current().id(), "another EventLoop exists in this thread");
                panic!("another EventLoop exists in this thread");
            }
        });

        let wakeup_fd = socket::create_event_fd();
        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| {
            let wakeup_channel = Channel::new(weak.clone(), wakeup_fd.as_raw_fd());
            EventLoop {
                thread_id: thread::current().id(),
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                event_handling: AtomicBool::new(false),
                calling_pending_tasks: AtomicBool::new(false),
                poller: Mutex::new(Poller::new()),
                timer_queue: TimerQueue::new(weak.clone()),
                wakeup_fd,
                wakeup_channel,
                pending_tasks: Mutex::new(Vec::new()),
            }
        });

        CURRENT_LOOP.with(|slot| {
            *slot.borrow_mut() = Arc::downgrade(&event_loop);
        });

        let weak = Arc::downgrade(&event_loop);
        event_loop.wakeup_channel.set_read_callback(Arc::new(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.handle_wakeup();
            }
        }));
        event_loop.wakeup_channel.enable_reading();
        event_loop.timer_queue.register();

        debug!(thread = ?event_loop.thread_id, "event loop created");
        event_loop
    }

    /// The loop owned by the calling thread, if one exists.
    pub fn current() -> Option<Arc<EventLoop>> {
        CURRENT_LOOP.with(|slot| slot.borrow().upgrade())
    }

    /// Run the reactor until [`quit`](Self::quit). Blocks the calling
    /// thread, which must be the thread that created the loop.
    pub fn run(&self) {
        assert!(
            !self.looping.swap(true, Ordering::SeqCst),
            "loop already running"
        );
        self.assert_in_loop_thread();
        self.quit.store(false, Ordering::SeqCst);
        trace!("event loop starts looping");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::SeqCst) {
            active.clear();
            // The timer fd supplies every timed wakeup and the wakeup fd
            // covers posted tasks, so the wait itself is unbounded.
            let receive_time = self.poller.lock().poll(-1, &mut active);

            self.event_handling.store(true, Ordering::SeqCst);
            for channel in &active {
                channel.handle_event(receive_time);
            }
            self.event_handling.store(false, Ordering::SeqCst);

            self.do_pending_tasks();
        }

        trace!("event loop stops looping");
        self.looping.store(false, Ordering::SeqCst);
    }

    /// Ask the loop to exit after the current cycle. Callers necessarily
    /// hold a strong reference for the duration of this call, which is what
    /// keeps the wakeup write safe against concurrent destruction.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the loop thread: immediately when already there,
    /// otherwise enqueued with a wakeup.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueue `task` for the loop thread, waking it when the caller is
    /// off-loop or the loop is currently draining tasks (a task posted from
    /// within a task must not wait for the next I/O event).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending_tasks.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    /// Run `callback` at `when`.
    pub fn run_at(&self, when: Instant, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.timer_queue.add_timer(Arc::new(callback), when, None)
    }

    /// Run `callback` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Run `callback` every `interval`, starting one interval from now.
    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> TimerId {
        let callback: TimerCallback = Arc::new(callback);
        self.timer_queue
            .add_timer(callback, Instant::now() + interval, Some(interval))
    }

    pub fn cancel(&self, id: TimerId) {
        self.timer_queue.cancel(id);
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        self.thread_id == thread::current().id()
    }

    /// # Panics
    ///
    /// Panics when called from any thread other than the loop thread.
    /// Mutating loop-owned state off-thread would corrupt the ordering
    /// guarantees silently, so this is fatal.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            error!(
                owner = ?self.thread_id,
                current = ?thread::current().id(),
                "event loop used off its thread"
            );
            panic!(
                "event loop owned by {:?} used from {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        assert!(
            std::ptr::eq(channel.owner_loop_ptr(), self),
            "channel belongs to another loop"
        );
        self.assert_in_loop_thread();
        self.poller.lock().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        assert!(
            std::ptr::eq(channel.owner_loop_ptr(), self),
            "channel belongs to another loop"
        );
        self.assert_in_loop_thread();
        self.poller.lock().remove_channel(channel);
    }

    /// Whether `channel` is tracked by this loop's poller.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.lock().has_channel(channel)
    }

    /// Write one count to the event counter; its readability breaks the
    /// blocking poll.
    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            let err = io::Error::last_os_error();
            error!(bytes = n, %err, "wakeup write failed");
        }
    }

    /// Drain the event counter. One read suffices because reading resets it.
    fn handle_wakeup(&self) {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            let err = io::Error::last_os_error();
            error!(bytes = n, %err, "wakeup read failed");
        }
    }

    /// Swap the queue out under the lock, run outside it. The short critical
    /// section keeps posters unblocked, and a task that posts again simply
    /// lands in the fresh vector for the next cycle.
    fn do_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::SeqCst);
        let tasks = mem::take(&mut *self.pending_tasks.lock());
        for task in tasks {
            task();
        }
        self.calling_pending_tasks.store(false, Ordering::SeqCst);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!(thread = ?self.thread_id, "event loop destroyed");
        // The thread-local slot holds a weak reference, so it vacates
        // itself; the poller, timer fd and wakeup fd close with their
        // owners.
    }
}
