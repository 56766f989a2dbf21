//! Per-connection state machine, read/write path, and shutdown sequencing.
//!
//! A connection is created on the accept loop, lives on a worker loop, and
//! is removed by the accept loop again; the strong handles travel inside
//! posted tasks. All buffer and channel mutation is confined to the worker
//! loop's thread; the internal locks exist so the handle can cross threads,
//! and are never contended.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

pub type TcpConnectionPtr = Arc<TcpConnection>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const INITIAL_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    owner_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    callbacks: Mutex<Callbacks>,
    high_water_mark: AtomicUsize,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl TcpConnection {
    /// Wrap an already-connected socket. Called by the server with the
    /// worker loop the connection will live on.
    pub(crate) fn new(
        owner_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let channel = Channel::new(Arc::downgrade(&owner_loop), socket.fd());
        let connection = Arc::new(TcpConnection {
            owner_loop,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel: channel.clone(),
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            callbacks: Mutex::new(Callbacks::default()),
            high_water_mark: AtomicUsize::new(INITIAL_HIGH_WATER_MARK),
            context: Mutex::new(None),
        });
        debug!(name = %connection.name, fd = connection.socket.fd(), "connection created");

        let weak = Arc::downgrade(&connection);
        channel.set_read_callback(Arc::new(move |receive_time| {
            if let Some(connection) = weak.upgrade() {
                connection.handle_read(receive_time);
            }
        }));
        let weak = Arc::downgrade(&connection);
        channel.set_write_callback(Arc::new(move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_write();
            }
        }));
        let weak = Arc::downgrade(&connection);
        channel.set_close_callback(Arc::new(move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_close();
            }
        }));
        let weak = Arc::downgrade(&connection);
        channel.set_error_callback(Arc::new(move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_error();
            }
        }));
        connection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.owner_loop
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.lock().connection = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().message = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(callback);
    }

    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        self.callbacks.lock().high_water_mark = Some(callback);
        self.high_water_mark.store(mark, Ordering::SeqCst);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        self.callbacks.lock().close = Some(callback);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = self.socket.set_tcp_no_delay(on) {
            warn!(name = %self.name, %err, "TCP_NODELAY failed");
        }
    }

    /// Access the opaque per-connection user slot.
    pub fn with_context<R>(
        &self,
        f: impl FnOnce(&mut Option<Box<dyn Any + Send + Sync>>) -> R,
    ) -> R {
        f(&mut self.context.lock())
    }

    /// Queue `data` for the peer. On the loop thread an empty output buffer
    /// gets a direct non-blocking write first; off-thread the bytes are
    /// copied and posted, because the caller's slice does not outlive the
    /// call.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.owner_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let connection = Arc::clone(self);
            let owned = data.to_vec();
            self.owner_loop
                .run_in_loop(move || connection.send_in_loop(&owned));
        }
    }

    /// Send everything readable in `buffer`, draining it. The bytes are
    /// copied out; the argument is consumed either way.
    pub fn send_buffer(self: &Arc<Self>, buffer: &mut Buffer) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.owner_loop.is_in_loop_thread() {
            self.send_in_loop(buffer.peek());
            buffer.retrieve_all();
        } else {
            let connection = Arc::clone(self);
            let owned = buffer.retrieve_all_as_bytes();
            self.owner_loop
                .run_in_loop(move || connection.send_in_loop(&owned));
        }
    }

    /// Close the write half once the output buffer drains. The connection
    /// stays readable until the peer closes its side.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let connection = Arc::clone(self);
            self.owner_loop.run_in_loop(move || connection.shutdown_in_loop());
        }
    }

    /// Drop the connection without draining: `handle_close` is posted to the
    /// loop, discarding whatever is still buffered.
    pub fn force_close(self: &Arc<Self>) {
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.set_state(ConnState::Disconnecting);
            let connection = Arc::clone(self);
            self.owner_loop.queue_in_loop(move || {
                let state = connection.state();
                if state == ConnState::Connected || state == ConnState::Disconnecting {
                    connection.handle_close();
                }
            });
        }
    }

    /// First half of the lifecycle: register for reading and report the
    /// connection up. Runs on the worker loop.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.owner_loop.assert_in_loop_thread();
        assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);
        self.channel.tie(self);
        self.channel.enable_reading();

        if let Some(callback) = self.connection_callback() {
            callback(self);
        }
    }

    /// Final teardown, posted by the server after the connection left its
    /// map. Runs the disconnect branch if closure raced, then unregisters
    /// the channel.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        self.owner_loop.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            if let Some(callback) = self.connection_callback() {
                callback(self);
            }
        }
        if self.channel.added_to_loop() {
            self.channel.remove();
        }
        debug!(name = %self.name, "connection destroyed");
    }

    fn state(&self) -> ConnState {
        match self.state.load(Ordering::SeqCst) {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.callbacks.lock().connection.clone()
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        self.owner_loop.assert_in_loop_thread();
        let mut input = self.input_buffer.lock();
        match input.read_fd(self.socket.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                trace!(name = %self.name, bytes = n, "read");
                let callback = self.callbacks.lock().message.clone();
                match callback {
                    Some(callback) => callback(self, &mut input, receive_time),
                    None => input.retrieve_all(),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(input);
                error!(name = %self.name, %err, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.owner_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(name = %self.name, "connection is down, no more writing");
            return;
        }
        let mut output = self.output_buffer.lock();
        match self.socket.write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    let callback = self.callbacks.lock().write_complete.clone();
                    drop(output);
                    if let Some(callback) = callback {
                        let connection = Arc::clone(self);
                        self.owner_loop
                            .queue_in_loop(move || callback(&connection));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!(name = %self.name, %err, "write failed");
            }
        }
    }

    /// The only path that reports the connection down and unhooks it from
    /// the server, so every callback still observes a live connection.
    fn handle_close(self: &Arc<Self>) {
        self.owner_loop.assert_in_loop_thread();
        let state = self.state();
        assert!(
            state == ConnState::Connected || state == ConnState::Disconnecting,
            "closing connection in state {state:?}"
        );
        debug!(name = %self.name, ?state, "connection closing");
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        let (connection_cb, close_cb) = {
            let callbacks = self.callbacks.lock();
            (callbacks.connection.clone(), callbacks.close.clone())
        };
        if let Some(callback) = connection_cb {
            callback(self);
        }
        if let Some(callback) = close_cb {
            callback(self);
        }
    }

    fn handle_error(&self) {
        let err = match self.socket.take_error() {
            Ok(Some(err)) => err,
            Ok(None) => io::Error::other("unknown socket error"),
            Err(err) => err,
        };
        error!(name = %self.name, %err, "connection error");
    }

    fn shutdown_in_loop(&self) {
        self.owner_loop.assert_in_loop_thread();
        if !self.channel.is_writing()
            && let Err(err) = self.socket.shutdown_write()
        {
            error!(name = %self.name, %err, "shutdown failed");
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.owner_loop.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            warn!(name = %self.name, "disconnected, giving up writing");
            return;
        }

        let mut wrote = 0usize;
        let mut fault = false;
        let mut output = self.output_buffer.lock();

        // Direct write only when nothing is queued ahead of this data.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        let callback = self.callbacks.lock().write_complete.clone();
                        if let Some(callback) = callback {
                            let connection = Arc::clone(self);
                            self.owner_loop
                                .queue_in_loop(move || callback(&connection));
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!(name = %self.name, %err, "write failed");
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    ) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && wrote < data.len() {
            let queued = output.readable_bytes();
            let total = queued + data.len() - wrote;
            let mark = self.high_water_mark.load(Ordering::SeqCst);
            // Only the upward crossing is reported.
            if total >= mark && queued < mark {
                let callback = self.callbacks.lock().high_water_mark.clone();
                if let Some(callback) = callback {
                    let connection = Arc::clone(self);
                    self.owner_loop
                        .queue_in_loop(move || callback(&connection, total));
                }
            }
            output.append(&data[wrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        trace!(name = %self.name, state = ?self.state(), "connection dropped");
    }
}

/// Logs the connection transitions; used when the server's owner installs
/// nothing else.
pub fn default_connection_callback(connection: &TcpConnectionPtr) {
    debug!(
        local = %connection.local_addr(),
        peer = %connection.peer_addr(),
        up = connection.connected(),
        "connection state"
    );
}

/// Discards incoming bytes; used when the server's owner installs nothing
/// else, so an unhandled connection cannot grow its input without bound.
pub fn default_message_callback(
    _connection: &TcpConnectionPtr,
    buffer: &mut Buffer,
    _receive_time: Instant,
) {
    buffer.retrieve_all();
}
