//! Listening socket plus the channel that drains its accept queue.

use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket::{self, Socket};

/// Receives each accepted socket with its peer address.
pub type NewConnectionCallback = Box<dyn Fn(Socket, SocketAddr) + Send + Sync>;

pub struct Acceptor {
    owner_loop: Arc<EventLoop>,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    /// Reserve descriptor closed and reopened to shed one connection when
    /// the process runs out of fds; otherwise the readable listener would
    /// busy-loop.
    idle_fd: Mutex<Option<OwnedFd>>,
    listening: AtomicBool,
    on_new_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        owner_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let accept_socket = Socket::bind_listening(listen_addr, reuse_port)?;
        let accept_channel = Channel::new(Arc::downgrade(owner_loop), accept_socket.fd());
        let acceptor = Arc::new(Acceptor {
            owner_loop: owner_loop.clone(),
            accept_socket,
            accept_channel,
            idle_fd: Mutex::new(Some(socket::open_idle_fd())),
            listening: AtomicBool::new(false),
            on_new_connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.accept_channel.set_read_callback(Arc::new(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));
        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.on_new_connection.lock() = Some(callback);
    }

    /// The bound address, with the port resolved when the listen address
    /// asked for port 0.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.accept_socket.local_addr()
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Start listening and watch the socket for readable events. Runs on
    /// the accept loop's thread.
    pub fn listen(&self) {
        self.owner_loop.assert_in_loop_thread();
        self.listening.store(true, Ordering::SeqCst);
        if let Err(err) = self.accept_socket.listen() {
            error!(%err, "listen failed");
            panic!("listen failed: {err}");
        }
        self.accept_channel.enable_reading();
    }

    /// Accept until the queue drains. One readable event may cover several
    /// pending connections.
    fn handle_read(&self) {
        self.owner_loop.assert_in_loop_thread();
        loop {
            match self.accept_socket.accept() {
                Ok((socket, peer_addr)) => {
                    let callback = self.on_new_connection.lock();
                    match &*callback {
                        Some(callback) => callback(socket, peer_addr),
                        // No handler installed: dropping the socket closes it.
                        None => warn!(%peer_addr, "accepted connection with no handler"),
                    }
                }
                Err(err) => {
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => {}
                        Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                        Some(libc::EMFILE) => {
                            warn!("fd exhausted, shedding one connection");
                            self.shed_one_connection();
                            continue;
                        }
                        _ => error!(%err, "accept failed"),
                    }
                    break;
                }
            }
        }
    }

    /// Free the reserve fd, accept-and-close one pending connection, then
    /// restore the reserve.
    fn shed_one_connection(&self) {
        let mut idle = self.idle_fd.lock();
        drop(idle.take());
        let fd = unsafe {
            libc::accept(self.accept_socket.fd(), std::ptr::null_mut(), std::ptr::null_mut())
        };
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        *idle = Some(socket::open_idle_fd());
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Events off first, then the channel, then the fd closes with the
        // socket. Closing the fd earlier would leave the poller holding a
        // stale registration.
        if self.accept_channel.added_to_loop() && self.owner_loop.is_in_loop_thread() {
            self.accept_channel.disable_all();
            self.accept_channel.remove();
        }
    }
}
