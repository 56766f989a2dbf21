//! Worker threads that each host one event loop, and the round-robin pool
//! the server draws from.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::event_loop::EventLoop;

/// Invoked on each worker loop before it starts looping, e.g. to set up
/// thread-local state.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Owns an OS thread running one event loop. Dropping the handle quits the
/// loop and joins the thread.
pub struct EventLoopThread {
    event_loop: Arc<Mutex<Option<Arc<EventLoop>>>>,
    loop_started: Arc<Condvar>,
    thread: Option<JoinHandle<()>>,
    init: Option<ThreadInitCallback>,
    name: String,
}

impl EventLoopThread {
    pub fn new(init: Option<ThreadInitCallback>, name: impl Into<String>) -> EventLoopThread {
        EventLoopThread {
            event_loop: Arc::new(Mutex::new(None)),
            loop_started: Arc::new(Condvar::new()),
            thread: None,
            init,
            name: name.into(),
        }
    }

    /// Spawn the thread, wait until its loop is constructed, and return the
    /// loop handle.
    pub fn start_loop(&mut self) -> Arc<EventLoop> {
        assert!(self.thread.is_none(), "event loop thread already started");

        let slot = self.event_loop.clone();
        let started = self.loop_started.clone();
        let init = self.init.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new();
                if let Some(init) = &init {
                    init(&event_loop);
                }
                {
                    let mut guard = slot.lock();
                    *guard = Some(event_loop.clone());
                    started.notify_one();
                }
                event_loop.run();
                *slot.lock() = None;
            })
            .expect("failed to spawn event loop thread");
        self.thread = Some(handle);

        let mut guard = self.event_loop.lock();
        while guard.is_none() {
            self.loop_started.wait(&mut guard);
        }
        guard.clone().unwrap()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let event_loop = self.event_loop.lock().clone();
        if let Some(event_loop) = event_loop {
            event_loop.quit();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// The base loop plus N worker loops handed out round-robin.
///
/// With zero workers every connection lives on the base loop. `start` and
/// `next_loop` run only on the base loop's thread, so the rotation cursor
/// needs no synchronization beyond the owner's lock.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: bool,
    thread_count: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            started: false,
            thread_count: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_count(&mut self, count: usize) {
        assert!(!self.started, "pool already started");
        self.thread_count = count;
    }

    /// Spawn the worker loops. Must be called exactly once, on the base
    /// loop's thread.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started, "pool already started");
        self.base_loop.assert_in_loop_thread();
        self.started = true;

        if self.thread_count == 0
            && let Some(init) = &init
        {
            init(&self.base_loop);
        }
        for index in 0..self.thread_count {
            let mut thread =
                EventLoopThread::new(init.clone(), format!("{}-io-{}", self.name, index));
            let event_loop = thread.start_loop();
            self.threads.push(thread);
            self.loops.push(event_loop);
        }
        debug!(name = %self.name, workers = self.thread_count, "thread pool started");
    }

    /// Next loop in rotation; the base loop when the pool has no workers.
    pub fn next_loop(&mut self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started, "pool not started");

        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let event_loop = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        event_loop
    }

    /// Every loop in the pool; the base loop alone when there are no
    /// workers. Useful for broadcasting.
    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }
}
