// src/dispatch.rs
use crate::conn::{Conn, ConnState};
use crate::parser::{Method, MAX_TARGET_LEN};
use crate::router::Router;

pub static NOT_FOUND_JSON: &[u8] = br#"{"error":"Not Found"}"#;
pub static BAD_REQUEST_JSON: &[u8] = br#"{"error":"Bad Request"}"#;
pub static METHOD_NOT_ALLOWED_JSON: &[u8] = br#"{"error":"Method Not Allowed"}"#;
pub static INTERNAL_ERROR_JSON: &[u8] = br#"{"error":"Internal Server Error"}"#;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalError,
}

impl Status {
    fn line(self) -> &'static [u8] {
        match self {
            Status::Ok => b"HTTP/1.1 200 OK\r\n",
            Status::BadRequest => b"HTTP/1.1 400 Bad Request\r\n",
            Status::NotFound => b"HTTP/1.1 404 Not Found\r\n",
            Status::MethodNotAllowed => b"HTTP/1.1 405 Method Not Allowed\r\n",
            Status::InternalError => b"HTTP/1.1 500 Internal Server Error\r\n",
        }
    }
}

/// Routes the parsed request and formats the response head into the
/// connection's header scratch, leaving the record in Writing with the
/// scatter list (header slice, static body) armed and `bytes_sent` zeroed.
///
/// Error responses disable keep-alive. Returns true when the header scratch
/// overflowed and the canned 500 was substituted.
pub fn prepare_response(conn: &mut Conn, router: &Router, keep_alive_secs: u64) -> bool {
    // Work on a local copy of the target, truncated at '?' for routing.
    let mut target = [0u8; MAX_TARGET_LEN];
    let tlen = conn.target_len as usize;
    target[..tlen].copy_from_slice(&conn.target[..tlen]);
    let mut path: &[u8] = &target[..tlen];
    if let Some(q) = path.iter().position(|&c| c == b'?') {
        path = &path[..q];
    }

    let (status, body, keep_alive) = if path.is_empty() || path[0] != b'/' {
        (Status::BadRequest, BAD_REQUEST_JSON, false)
    } else if conn.method != Method::Get {
        (Status::MethodNotAllowed, METHOD_NOT_ALLOWED_JSON, false)
    } else {
        match router.lookup(path) {
            Some(body) => (Status::Ok, body, conn.keep_alive),
            None => (Status::NotFound, NOT_FOUND_JSON, false),
        }
    };

    let mut overflowed = false;
    let (body, keep_alive, header_len) =
        match write_headers(&mut conn.header_buf, status, body.len(), keep_alive, keep_alive_secs)
        {
            Some(len) => (body, keep_alive, len),
            None => {
                // Should not happen with static routes; substitute the canned
                // 500 and close after sending.
                overflowed = true;
                let len = write_headers(
                    &mut conn.header_buf,
                    Status::InternalError,
                    INTERNAL_ERROR_JSON.len(),
                    false,
                    keep_alive_secs,
                )
                .unwrap_or(0);
                (INTERNAL_ERROR_JSON, false, len)
            }
        };

    conn.header_len = header_len as u32;
    conn.body = body;
    conn.bytes_sent = 0;
    conn.keep_alive = keep_alive;
    conn.state = ConnState::Writing;
    overflowed
}

fn write_headers(
    buf: &mut [u8],
    status: Status,
    content_len: usize,
    keep_alive: bool,
    keep_alive_secs: u64,
) -> Option<usize> {
    let mut w = Scratch::new(buf);
    w.put(status.line());
    w.put(b"Content-Type: application/json\r\n");
    w.put(b"Content-Length: ");
    w.put_usize(content_len);
    w.put(b"\r\n");
    w.put(b"Server: BFF/1.0\r\n");
    w.put(b"X-Content-Type-Options: nosniff\r\n");
    w.put(b"X-Frame-Options: DENY\r\n");
    if keep_alive {
        w.put(b"Connection: keep-alive\r\nKeep-Alive: timeout=");
        w.put_usize(keep_alive_secs as usize);
        w.put(b"\r\n");
    } else {
        w.put(b"Connection: close\r\n");
    }
    w.put(b"\r\n");
    w.finish()
}

/// Bounds-checked writer over the fixed header scratch. Overflow latches and
/// `finish` reports it; nothing past the end is ever written.
struct Scratch<'a> {
    buf: &'a mut [u8],
    len: usize,
    overflow: bool,
}

impl<'a> Scratch<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            len: 0,
            overflow: false,
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        if self.overflow {
            return;
        }
        if self.len + bytes.len() > self.buf.len() {
            self.overflow = true;
            return;
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    fn put_usize(&mut self, n: usize) {
        let mut digits = [0u8; 20];
        let mut i = 0;
        let mut n = n;
        if n == 0 {
            digits[0] = b'0';
            i = 1;
        } else {
            while n > 0 {
                digits[i] = b'0' + (n % 10) as u8;
                n /= 10;
                i += 1;
            }
            digits[..i].reverse();
        }
        self.put(&digits[..i]);
    }

    fn finish(self) -> Option<usize> {
        if self.overflow {
            None
        } else {
            Some(self.len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Method;

    fn request_conn(method: Method, target: &[u8], keep_alive: bool) -> Conn {
        let mut conn = Conn::empty();
        conn.reset_for_acquire();
        conn.target[..target.len()].copy_from_slice(target);
        conn.target_len = target.len() as u8;
        conn.method = method;
        conn.keep_alive = keep_alive;
        conn
    }

    fn routes() -> Router {
        let mut router = Router::new();
        router.add("/health", br#"{"status":"OK"}"#);
        router.add("/games", br#"{"games":["chess","poker"]}"#);
        router
    }

    fn headers(conn: &Conn) -> String {
        String::from_utf8_lossy(&conn.header_buf[..conn.header_len as usize]).into_owned()
    }

    #[test]
    fn test_known_route_keep_alive() {
        let mut conn = request_conn(Method::Get, b"/health", true);
        let overflowed = prepare_response(&mut conn, &routes(), 10);
        assert!(!overflowed);
        assert_eq!(conn.state, ConnState::Writing);
        assert!(conn.keep_alive);
        assert_eq!(conn.body, br#"{"status":"OK"}"#);
        assert_eq!(conn.bytes_sent, 0);

        let head = headers(&conn);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: application/json\r\n"));
        assert!(head.contains("Content-Length: 15\r\n"));
        assert!(head.contains("Server: BFF/1.0\r\n"));
        assert!(head.contains("X-Content-Type-Options: nosniff\r\n"));
        assert!(head.contains("X-Frame-Options: DENY\r\n"));
        assert!(head.contains("Connection: keep-alive\r\nKeep-Alive: timeout=10\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_query_stripped_for_routing() {
        let mut conn = request_conn(Method::Get, b"/health?probe=1", true);
        prepare_response(&mut conn, &routes(), 10);
        assert!(headers(&conn).starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn test_unknown_route_closes() {
        let mut conn = request_conn(Method::Get, b"/nope", true);
        prepare_response(&mut conn, &routes(), 10);
        assert!(!conn.keep_alive);
        assert_eq!(conn.body, NOT_FOUND_JSON);
        let head = headers(&conn);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("Keep-Alive:"));
    }

    #[test]
    fn test_wrong_method_closes() {
        let mut conn = request_conn(Method::Post, b"/health", true);
        prepare_response(&mut conn, &routes(), 10);
        assert!(!conn.keep_alive);
        assert_eq!(conn.body, METHOD_NOT_ALLOWED_JSON);
        assert!(headers(&conn).starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    }

    #[test]
    fn test_empty_target_is_bad_request() {
        let mut conn = request_conn(Method::Get, b"", true);
        prepare_response(&mut conn, &routes(), 10);
        assert_eq!(conn.body, BAD_REQUEST_JSON);
        assert!(headers(&conn).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_scratch_overflow_latches() {
        let mut buf = [0u8; 8];
        let mut w = Scratch::new(&mut buf);
        w.put(b"12345");
        w.put(b"6789"); // would exceed: latches, writes nothing
        assert!(w.finish().is_none());

        let mut buf = [0u8; 8];
        let mut w = Scratch::new(&mut buf);
        w.put(b"1234");
        w.put_usize(5678);
        assert_eq!(w.finish(), Some(8));
        assert_eq!(&buf, b"12345678");
    }

    #[test]
    fn test_put_usize_digits() {
        let mut buf = [0u8; 20];
        let mut w = Scratch::new(&mut buf);
        w.put_usize(0);
        w.put_usize(10);
        w.put_usize(65536);
        let len = w.finish().unwrap();
        assert_eq!(&buf[..len], b"01065536");
    }
}
