//! The line protocol: `[id:]payload\r\n` in, `[id:]result\r\n` out.
//!
//! The payload must be exactly `cell_count` bytes; the result mirrors it
//! back. A malformed request gets `Bad Request!\r\n` and a write-half
//! shutdown, so the client still reads the error before EOF.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use reactor::{Buffer, TcpConnectionPtr, TcpServer};

const BAD_REQUEST: &[u8] = b"Bad Request!\r\n";

pub struct LineService {
    cell_count: usize,
}

impl LineService {
    pub fn new(cell_count: usize) -> Arc<LineService> {
        Arc::new(LineService { cell_count })
    }

    /// Wire this service's message handling into `server`.
    pub fn install(self: &Arc<Self>, server: &TcpServer) {
        let service = self.clone();
        server.set_message_callback(Arc::new(move |conn, buffer, when| {
            service.on_message(conn, buffer, when);
        }));
    }

    fn on_message(&self, conn: &TcpConnectionPtr, buffer: &mut Buffer, _when: Instant) {
        // The smallest complete request is payload + CRLF; anything shorter
        // may still be a fragment, so wait for more bytes.
        while buffer.readable_bytes() >= self.cell_count + 2 {
            let Some(crlf) = buffer.find_crlf() else {
                warn!(conn = %conn.name(), "request exceeds frame without CRLF");
                reject(conn);
                return;
            };
            let line = buffer.peek()[..crlf].to_vec();
            buffer.retrieve_until(crlf + 2);

            match process_line(&line, self.cell_count) {
                Some(response) => {
                    debug!(conn = %conn.name(), bytes = line.len(), "request served");
                    conn.send(&response);
                }
                None => {
                    warn!(conn = %conn.name(), "malformed request");
                    reject(conn);
                    return;
                }
            }
        }
    }
}

fn reject(conn: &TcpConnectionPtr) {
    conn.send(BAD_REQUEST);
    conn.shutdown();
}

/// Build the response for one framed line, or `None` if the request is
/// malformed. The optional id before the first `:` is echoed back in front
/// of the result.
pub fn process_line(line: &[u8], cell_count: usize) -> Option<Vec<u8>> {
    let (id, payload) = match line.iter().position(|&b| b == b':') {
        Some(colon) => (Some(&line[..colon]), &line[colon + 1..]),
        None => (None, line),
    };
    if payload.len() != cell_count {
        return None;
    }

    let mut response = Vec::with_capacity(line.len() + 2);
    if let Some(id) = id {
        response.extend_from_slice(id);
        response.push(b':');
    }
    response.extend_from_slice(payload);
    response.extend_from_slice(b"\r\n");
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_request() {
        let response = process_line(b"abcd", 4).unwrap();
        assert_eq!(response, b"abcd\r\n");
    }

    #[test]
    fn test_request_with_id() {
        let response = process_line(b"42:abcd", 4).unwrap();
        assert_eq!(response, b"42:abcd\r\n");
    }

    #[test]
    fn test_wrong_payload_length_rejected() {
        assert!(process_line(b"abc", 4).is_none());
        assert!(process_line(b"abcde", 4).is_none());
        assert!(process_line(b"42:abc", 4).is_none());
    }

    #[test]
    fn test_empty_id_is_kept() {
        // ":payload" carries an empty id; it is still echoed back.
        let response = process_line(b":abcd", 4).unwrap();
        assert_eq!(response, b":abcd\r\n");
    }

    #[test]
    fn test_first_colon_splits_id() {
        let response = process_line(b"a:b:cd", 4).unwrap();
        assert_eq!(response, b"a:b:cd\r\n");
    }
}
