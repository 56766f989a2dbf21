//! Growable byte queue used for per-connection input and output.
//!
//! The buffer keeps three regions over one allocation:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0        <=     read_index   <=   write_index    <=    len
//! ```
//!
//! A small prepend region is reserved in front of the data so that a
//! message-length prefix can be written in place without copying the
//! payload. When the writable tail runs out, unread bytes are shuffled to
//! the front if that frees enough room; the allocation only grows when the
//! data genuinely does not fit.

use std::io;
use std::os::fd::RawFd;

/// Reserved space in front of the readable region for in-place prepends.
pub const CHEAP_PREPEND: usize = 8;

/// Initial size of the body (excluding the prepend region).
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack-resident scratch used by [`Buffer::read_fd`]. Reading
/// through a scatter pair means a single syscall can pull in a large packet
/// without every idle connection paying for a large buffer up front.
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with `capacity` writable bytes plus the prepend region.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; CHEAP_PREPEND + capacity],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// View the unread bytes without consuming them.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Byte offset of the first `\r\n` within [`peek`](Self::peek), if any.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Consume `n` bytes from the front of the readable region.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(
            n <= self.readable_bytes(),
            "retrieve({}) exceeds readable bytes ({})",
            n,
            self.readable_bytes()
        );
        if n == self.readable_bytes() {
            self.retrieve_all();
        } else {
            self.read_index += n;
        }
    }

    /// Consume everything before `offset` (an index into [`peek`](Self::peek)).
    pub fn retrieve_until(&mut self, offset: usize) {
        self.retrieve(offset);
    }

    /// Reset both cursors to the head of the prepend region.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consume and return all readable bytes.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Write `data` immediately in front of the readable region.
    ///
    /// # Panics
    ///
    /// Panics if the prepend region cannot hold `data`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend({}) exceeds prependable bytes ({})",
            data.len(),
            self.prependable_bytes()
        );
        self.read_index -= data.len();
        self.data[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    /// Read a big-endian u32 from the front without consuming it.
    ///
    /// # Panics
    ///
    /// Panics if fewer than four bytes are readable.
    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    /// Consume and return a big-endian u32 from the front.
    pub fn read_u32(&mut self) -> u32 {
        let value = self.peek_u32();
        self.retrieve(4);
        value
    }

    pub fn append_u32(&mut self, value: u32) {
        self.append(&value.to_be_bytes());
    }

    /// Prepend a big-endian u32, typically a length prefix for the bytes
    /// already appended.
    pub fn prepend_u32(&mut self, value: u32) {
        self.prepend(&value.to_be_bytes());
    }

    fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
    }

    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            // Shuffling cannot free enough room, grow the allocation.
            self.data.resize(self.write_index + n, 0);
        } else {
            // Move unread bytes to the front, reclaiming retrieved space.
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
    }

    /// Read from `fd` into the buffer with a scatter pair: the writable tail
    /// first, then a 64 KiB stack scratch. Bytes that overflowed into the
    /// scratch are appended afterward.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.data[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // When the tail is already large, one segment is enough.
        let iovcnt: libc::c_int = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        let data = vec![b'x'; 200];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.peek(), &data[..]);

        buf.retrieve(200);
        assert_eq!(buf.readable_bytes(), 0);
        // Full consumption resets to the initial layout.
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn test_partial_retrieve_moves_read_cursor() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 6);
    }

    #[test]
    fn test_prepend_after_append() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(b"hd");
        assert_eq!(buf.peek(), b"hdpayload");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 2);
    }

    #[test]
    fn test_length_prefix_in_place() {
        let mut buf = Buffer::new();
        buf.append(b"body");
        buf.prepend_u32(4);
        assert_eq!(buf.readable_bytes(), 8);
        assert_eq!(buf.read_u32(), 4);
        assert_eq!(buf.peek(), b"body");
    }

    #[test]
    #[should_panic(expected = "exceeds prependable bytes")]
    fn test_prepend_overflow_panics() {
        let mut buf = Buffer::new();
        buf.append(b"x");
        buf.prepend(&[0u8; CHEAP_PREPEND + 1]);
    }

    #[test]
    fn test_find_crlf() {
        let mut buf = Buffer::new();
        buf.append(b"payload\r\ntrailing");
        assert_eq!(buf.find_crlf(), Some(7));

        let mut empty = Buffer::new();
        empty.append(b"no line ending");
        assert_eq!(empty.find_crlf(), None);
    }

    #[test]
    fn test_retrieve_until_line() {
        let mut buf = Buffer::new();
        buf.append(b"foo\r\nbar\r\n");
        let crlf = buf.find_crlf().unwrap();
        assert_eq!(&buf.peek()[..crlf], b"foo");
        buf.retrieve_until(crlf + 2);
        assert_eq!(buf.peek(), b"bar\r\n");
    }

    #[test]
    fn test_make_space_shuffles_before_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; INITIAL_SIZE]);
        buf.retrieve(800);
        assert_eq!(buf.writable_bytes(), 0);

        // 800 retrieved + 0 writable is enough for 700 more without growing.
        buf.append(&vec![b'b'; 700]);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE - 800 + 700);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn test_make_space_grows_when_shuffle_insufficient() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; INITIAL_SIZE]);
        buf.append(&vec![b'b'; 2000]);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE + 2000);
        let mut expected = vec![b'a'; INITIAL_SIZE];
        expected.extend_from_slice(&vec![b'b'; 2000]);
        assert_eq!(buf.peek(), &expected[..]);
    }

    #[test]
    fn test_retrieve_all_as_bytes() {
        let mut buf = Buffer::new();
        buf.append(b"drain me");
        assert_eq!(buf.retrieve_all_as_bytes(), b"drain me");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_read_fd_from_pipe() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let payload = vec![b'z'; 4096];
        let written = unsafe {
            libc::write(fds[1], payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(written, payload.len() as isize);

        let mut buf = Buffer::new();
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_read_fd_overflow_goes_through_extra() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // More than the initial writable space, so part of the read lands in
        // the stack scratch and is appended afterward.
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let written = unsafe {
            libc::write(fds[1], payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(written, payload.len() as isize);

        let mut buf = Buffer::with_capacity(128);
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
