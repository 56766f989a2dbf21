//! Socket ownership and the raw fd helpers the reactor is built on.
//!
//! A file descriptor is owned by exactly one [`Socket`] (or, for the wakeup
//! and timer descriptors, one `OwnedFd`). Channels never own descriptors.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Once;

use socket2::{Domain, Protocol, Type};
use tracing::error;

/// An owned, non-blocking TCP socket.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a non-blocking listening socket bound to `addr` with
    /// `SO_REUSEADDR` (and optionally `SO_REUSEPORT`) enabled.
    pub fn bind_listening(addr: SocketAddr, reuse_port: bool) -> io::Result<Socket> {
        let socket = socket2::Socket::new(
            Domain::for_address(addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            let optval: libc::c_int = 1;
            let ret = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_REUSEPORT,
                    &optval as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        socket.bind(&addr.into())?;
        Ok(Socket { inner: socket })
    }

    pub fn listen(&self) -> io::Result<()> {
        self.inner.listen(libc::SOMAXCONN)
    }

    /// Accept one pending connection. The new socket is created with
    /// non-blocking and close-on-exec set atomically.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let socket = Socket {
            inner: unsafe { socket2::Socket::from_raw_fd(fd) },
        };
        let peer = sockaddr_to_addr(&storage).unwrap_or_else(|| {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        });
        Ok((socket, peer))
    }

    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }

    /// Close the write half, letting buffered peer reads drain to EOF.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP local address"))
    }

    /// Fetch and clear the pending socket error (`SO_ERROR`).
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
                u16::from_be(sa.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sa.sin6_addr.s6_addr),
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Ignore `SIGPIPE` process-wide. A write to a peer-closed socket then
/// surfaces as `EPIPE` from the syscall instead of killing the process.
pub(crate) fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// Create the kernel event counter used to break a blocking poll.
pub(crate) fn create_event_fd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        error!(%err, "eventfd failed");
        panic!("eventfd failed: {err}");
    }
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Create the monotonic kernel timer backing the timer queue.
pub(crate) fn create_timer_fd() -> OwnedFd {
    let fd = unsafe {
        libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        error!(%err, "timerfd_create failed");
        panic!("timerfd_create failed: {err}");
    }
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Open the idle descriptor reserved for the EMFILE recovery path in the
/// acceptor.
pub(crate) fn open_idle_fd() -> OwnedFd {
    let fd = unsafe {
        libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC)
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        error!(%err, "open /dev/null failed");
        panic!("open /dev/null failed: {err}");
    }
    unsafe { OwnedFd::from_raw_fd(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listening_resolves_port() {
        let socket = Socket::bind_listening("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_accept_nonblocking_returns_would_block() {
        let socket = Socket::bind_listening("127.0.0.1:0".parse().unwrap(), false).unwrap();
        socket.listen().unwrap();
        let err = socket.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_accept_reports_peer_address() {
        let socket = Socket::bind_listening("127.0.0.1:0".parse().unwrap(), false).unwrap();
        socket.listen().unwrap();
        let addr = socket.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let client_addr = client.local_addr().unwrap();

        // Give the kernel a moment to queue the connection.
        let mut accepted = None;
        for _ in 0..100 {
            match socket.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let (_sock, peer) = accepted.expect("connection never arrived");
        assert_eq!(peer, client_addr);
    }
}
