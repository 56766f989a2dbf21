//! Multi-threaded, epoll-based reactor networking.
//!
//! One event loop per thread: a base loop accepts connections and hands each
//! one to a worker loop picked round-robin; the worker then drives that
//! connection's reads, writes, timers, and teardown on a single thread.
//! Cross-thread work is posted as tasks and picked up via an eventfd wakeup,
//! so no loop-owned state is ever touched off its thread.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reactor::{EventLoop, TcpServer};
//!
//! let event_loop = EventLoop::new();
//! let server = TcpServer::new(&event_loop, "127.0.0.1:7188".parse().unwrap(), false).unwrap();
//! server.set_thread_count(4);
//! server.set_message_callback(Arc::new(|conn, buffer, _when| {
//!     // Echo everything back.
//!     conn.send(&buffer.retrieve_all_as_bytes());
//! }));
//! server.start();
//! event_loop.run();
//! ```

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod event_loop;
pub mod event_loop_thread;
pub mod poller;
pub mod server;
pub mod socket;
pub mod timer;
pub mod timer_queue;

pub use buffer::Buffer;
pub use connection::{
    ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    TcpConnectionPtr, WriteCompleteCallback,
};
pub use event_loop::EventLoop;
pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use server::TcpServer;
pub use socket::Socket;
pub use timer::{TimerCallback, TimerId};
