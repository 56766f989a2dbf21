//! Glue between the acceptor, the worker pool, and the connection map.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
    default_connection_callback, default_message_callback,
};
use crate::event_loop::EventLoop;
use crate::event_loop_thread::{EventLoopThreadPool, ThreadInitCallback};
use crate::socket::Socket;

/// TCP server: owns the acceptor and the connection map, and hands each new
/// connection to a worker loop picked round-robin.
///
/// Connections are created on the accept loop, live on their worker loop,
/// and are removed by the accept loop; the map itself is only mutated on the
/// accept loop's thread.
pub struct TcpServer {
    owner_loop: Arc<EventLoop>,
    name: String,
    listen_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_connection_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionPtr, ahash::RandomState>>,
}

impl TcpServer {
    /// Bind `listen_addr`. The server does not listen until
    /// [`start`](Self::start).
    pub fn new(
        owner_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(owner_loop, listen_addr, reuse_port)?;
        let listen_addr = acceptor.listen_addr()?;
        let name = listen_addr.to_string();
        Ok(Arc::new(TcpServer {
            owner_loop: owner_loop.clone(),
            pool: Mutex::new(EventLoopThreadPool::new(owner_loop.clone(), name.clone())),
            name,
            listen_addr,
            acceptor,
            connection_callback: Mutex::new(Arc::new(default_connection_callback)),
            message_callback: Mutex::new(Arc::new(default_message_callback)),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            started: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::default()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address, with port 0 resolved.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Number of worker loops. Zero keeps all I/O on the accept loop. Must
    /// be set before [`start`](Self::start).
    pub fn set_thread_count(&self, count: usize) {
        self.pool.lock().set_thread_count(count);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock() = callback;
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock() = callback;
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock() = Some(callback);
    }

    /// Per-worker initializer, run on each loop before it starts looping.
    pub fn set_thread_init_callback(&self, callback: ThreadInitCallback) {
        *self.thread_init_callback.lock() = Some(callback);
    }

    /// Start the worker pool and the listener. Idempotent; the first call
    /// wins. Must be called on the accept loop's thread.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(name = %self.name, "server starting");
        let init = self.thread_init_callback.lock().clone();
        self.pool.lock().start(init);

        let weak = Arc::downgrade(self);
        self.acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            }));

        let acceptor = self.acceptor.clone();
        self.owner_loop.run_in_loop(move || acceptor.listen());
    }

    /// Runs on the accept loop for every accepted socket: name the
    /// connection, pick a worker, wire the callbacks, and hand it over.
    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: SocketAddr) {
        self.owner_loop.assert_in_loop_thread();
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("{}#{}", self.name, id);
        debug!(connection = %name, peer = %peer_addr, "new connection");

        let local_addr = socket.local_addr().unwrap_or(self.listen_addr);
        let io_loop = self.pool.lock().next_loop();
        let connection = TcpConnection::new(io_loop.clone(), name.clone(), socket, local_addr, peer_addr);

        connection.set_connection_callback(self.connection_callback.lock().clone());
        connection.set_message_callback(self.message_callback.lock().clone());
        if let Some(callback) = self.write_complete_callback.lock().clone() {
            connection.set_write_complete_callback(callback);
        }
        let weak = Arc::downgrade(self);
        connection.set_close_callback(Arc::new(move |connection: &TcpConnectionPtr| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(connection);
            }
        }));

        self.connections.lock().insert(name, connection.clone());
        io_loop.run_in_loop(move || connection.connect_established());
    }

    /// Thread-safe: invoked from whatever worker loop the connection closed
    /// on, then bounced to the accept loop which owns the map.
    fn remove_connection(self: &Arc<Self>, connection: &TcpConnectionPtr) {
        let server = Arc::clone(self);
        let connection = connection.clone();
        self.owner_loop
            .run_in_loop(move || server.remove_connection_in_loop(&connection));
    }

    fn remove_connection_in_loop(&self, connection: &TcpConnectionPtr) {
        self.owner_loop.assert_in_loop_thread();
        debug!(connection = %connection.name(), "removing connection");
        self.connections.lock().remove(connection.name());

        // Final teardown happens back on the worker loop; the posted task
        // carries the last strong handle across the hop.
        let io_loop = connection.owner_loop().clone();
        let connection = connection.clone();
        io_loop.queue_in_loop(move || connection.connect_destroyed());
    }

    /// Loops in the worker pool, for callers that broadcast timers or tasks.
    pub fn io_loops(&self) -> Vec<Arc<EventLoop>> {
        self.pool.lock().all_loops()
    }

    /// Live connection count, for tests and introspection.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        for (_, connection) in self.connections.lock().drain() {
            let io_loop = connection.owner_loop().clone();
            io_loop.run_in_loop(move || connection.connect_destroyed());
        }
    }
}
