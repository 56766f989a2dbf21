//! Loop-level guarantees: posting, wakeup, quitting, and the per-thread
//! singleton.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use reactor::EventLoop;
use reactor::event_loop_thread::{EventLoopThread, EventLoopThreadPool};

fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

#[test]
fn test_cross_thread_posts_are_all_executed() {
    const POSTERS: usize = 4;
    const POSTS_EACH: usize = 2500;

    let mut loop_thread = EventLoopThread::new(None, "post-target");
    let event_loop = loop_thread.start_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    let posters: Vec<_> = (0..POSTERS)
        .map(|_| {
            let event_loop = event_loop.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..POSTS_EACH {
                    let counter = counter.clone();
                    event_loop.queue_in_loop(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst)
            == POSTERS * POSTS_EACH),
        "only {} of {} posted tasks ran",
        counter.load(Ordering::SeqCst),
        POSTERS * POSTS_EACH
    );
}

#[test]
fn test_task_posted_from_task_runs_without_io() {
    let mut loop_thread = EventLoopThread::new(None, "repost-target");
    let event_loop = loop_thread.start_loop();
    let done = Arc::new(AtomicUsize::new(0));

    // The inner task is enqueued while the loop is draining tasks; with no
    // I/O traffic at all, only the self-wakeup can get it scheduled.
    let counter = done.clone();
    let handle = event_loop.clone();
    event_loop.queue_in_loop(move || {
        let counter = counter.clone();
        handle.queue_in_loop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    });

    assert!(
        wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst) == 1),
        "re-posted task never ran"
    );
}

#[test]
fn test_run_in_loop_executes_synchronously_on_loop_thread() {
    let mut loop_thread = EventLoopThread::new(None, "sync-target");
    let event_loop = loop_thread.start_loop();

    let (tx, rx) = mpsc::channel();
    let handle = event_loop.clone();
    event_loop.run_in_loop(move || {
        // Already on the loop thread here, so the nested call must run
        // inline, before this task returns.
        let ran_inline = Arc::new(AtomicUsize::new(0));
        let flag = ran_inline.clone();
        handle.run_in_loop(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        tx.send(ran_inline.load(Ordering::SeqCst)).unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
}

#[test]
fn test_second_loop_on_same_thread_is_fatal() {
    thread::spawn(|| {
        let _first = EventLoop::new();
        let result = panic::catch_unwind(AssertUnwindSafe(EventLoop::new));
        assert!(result.is_err(), "second loop on one thread must abort");
    })
    .join()
    .unwrap();
}

#[test]
fn test_loop_slot_vacated_after_destruction() {
    thread::spawn(|| {
        {
            let first = EventLoop::new();
            assert!(EventLoop::current().is_some());
            drop(first);
        }
        // The slot holds a dead weak now; a fresh loop is allowed.
        assert!(EventLoop::current().is_none());
        let _second = EventLoop::new();
    })
    .join()
    .unwrap();
}

#[test]
fn test_quit_from_other_thread_stops_loop() {
    let (tx, rx) = mpsc::channel();
    let runner = thread::spawn(move || {
        let event_loop = EventLoop::new();
        tx.send(event_loop.clone()).unwrap();
        event_loop.run();
    });

    let event_loop = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    event_loop.quit();
    runner.join().unwrap();
}

#[test]
fn test_pool_with_zero_threads_returns_base_loop() {
    let mut loop_thread = EventLoopThread::new(None, "pool-base");
    let base_loop = loop_thread.start_loop();

    let (tx, rx) = mpsc::channel();
    let handle = base_loop.clone();
    base_loop.run_in_loop(move || {
        let mut pool = EventLoopThreadPool::new(handle.clone(), "pool-test");
        pool.start(None);
        let next = pool.next_loop();
        tx.send(Arc::ptr_eq(&next, &handle)).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
}

#[test]
fn test_pool_init_callback_runs_on_every_worker() {
    let mut loop_thread = EventLoopThread::new(None, "pool-init");
    let base_loop = loop_thread.start_loop();
    let initialized = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = mpsc::channel();
    let counter = initialized.clone();
    let handle = base_loop.clone();
    base_loop.run_in_loop(move || {
        let mut pool = EventLoopThreadPool::new(handle, "pool-test");
        pool.set_thread_count(3);
        let counter = counter.clone();
        pool.start(Some(Arc::new(move |_loop| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        tx.send(pool).unwrap();
    });

    // Keep the pool alive until the check completes.
    let _pool = rx.recv().unwrap();
    assert_eq!(initialized.load(Ordering::SeqCst), 3);
}
