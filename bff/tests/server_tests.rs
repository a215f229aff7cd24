//! End-to-end tests: a real server on a loopback port, driven over raw TCP.
//! Timeouts are shortened so the timer scenarios run in well under a second.

use bff::{Router, Server};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TestServer {
    addr: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(port: u16, request_timeout_ms: u64, keep_alive_timeout_ms: u64) -> Self {
        let addr = format!("127.0.0.1:{}", port);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let bind = addr.clone();

        let handle = thread::spawn(move || {
            let mut router = Router::new();
            router.add("/bonuses", br#"{"bonuses":[10,20,30]}"#);
            router.add("/settings", br#"{"settings":{"theme":"dark"}}"#);
            router.add("/games", br#"{"games":["chess","poker"]}"#);
            router.add("/health", br#"{"status":"OK"}"#);

            let server = Server::bind(&bind)
                .workers(1)
                .max_connections(64)
                .fallback_connections(16)
                .request_timeout(Duration::from_millis(request_timeout_ms))
                .keep_alive_timeout(Duration::from_millis(keep_alive_timeout_ms));
            server.serve_until(router, flag).expect("server failed");
        });

        let server = Self {
            addr,
            shutdown,
            handle: Some(handle),
        };
        server.wait_ready();
        server
    }

    fn wait_ready(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(&self.addr) {
                Ok(_) => return,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Err(e) => panic!("server never came up on {}: {}", self.addr, e),
            }
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(&self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Reads one response: header block plus exactly Content-Length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 2048];
    let header_end = loop {
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf).expect("read response head");
        assert!(n > 0, "connection closed before a full response head");
        raw.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8(raw[..header_end].to_vec()).expect("ascii head");
    let content_length: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .expect("Content-Length header")
        .trim()
        .parse()
        .expect("numeric Content-Length");

    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).expect("read response body");
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&buf[..n]);
    }
    assert_eq!(body.len(), content_length, "no trailing bytes");
    (head, body)
}

/// True when the server closed without sending anything.
fn closed_without_response(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(ref e) if e.kind() == ErrorKind::ConnectionReset => true,
        Err(e) => panic!("unexpected read error: {}", e),
    }
}

fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, got {} bytes", n),
        Err(ref e) if e.kind() == ErrorKind::ConnectionReset => {}
        Err(e) => panic!("unexpected read error: {}", e),
    }
}

#[test]
fn test_healthcheck_keep_alive_reuse() {
    let server = TestServer::start(48161, 5000, 10_000);
    let mut stream = server.connect();

    for _ in 0..2 {
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);
        assert!(head.contains("Content-Type: application/json"));
        assert!(head.contains("Server: BFF/1.0"));
        assert!(head.contains("Connection: keep-alive"));
        assert!(head.contains("Keep-Alive: timeout=10"));
        assert_eq!(body, br#"{"status":"OK"}"#);
    }
}

#[test]
fn test_all_routes() {
    let server = TestServer::start(48162, 5000, 10_000);
    let cases: [(&str, &[u8]); 4] = [
        ("/bonuses", br#"{"bonuses":[10,20,30]}"#),
        ("/settings", br#"{"settings":{"theme":"dark"}}"#),
        ("/games", br#"{"games":["chess","poker"]}"#),
        ("/health", br#"{"status":"OK"}"#),
    ];
    let mut stream = server.connect();
    for (path, expected) in cases {
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: h\r\n\r\n", path).as_bytes())
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK"), "{}: {}", path, head);
        assert_eq!(body, expected, "body for {}", path);
    }
}

#[test]
fn test_unknown_route_404_closes() {
    let server = TestServer::start(48163, 5000, 10_000);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /nope HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "head: {}", head);
    assert!(head.contains("Connection: close"));
    assert_eq!(body, br#"{"error":"Not Found"}"#);
    assert_closed(&mut stream);
}

#[test]
fn test_minimal_request_unregistered_root() {
    let server = TestServer::start(48164, 5000, 10_000);
    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "head: {}", head);
    assert_eq!(body, br#"{"error":"Not Found"}"#);
}

#[test]
fn test_wrong_method() {
    let server = TestServer::start(48165, 5000, 10_000);

    // Zero-length declared body: rejected at the method gate with a 405.
    let mut stream = server.connect();
    stream
        .write_all(b"POST /health HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(
        head.starts_with("HTTP/1.1 405 Method Not Allowed"),
        "head: {}",
        head
    );
    assert!(head.contains("Connection: close"));
    assert_eq!(body, br#"{"error":"Method Not Allowed"}"#);
    assert_closed(&mut stream);

    // Nonzero body: closed at parse time, no response.
    let mut stream = server.connect();
    stream
        .write_all(b"POST /health HTTP/1.1\r\nHost: h\r\nContent-Length: 1\r\n\r\n")
        .unwrap();
    assert!(closed_without_response(&mut stream));
}

#[test]
fn test_path_traversal_closed() {
    let server = TestServer::start(48166, 5000, 10_000);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /../etc/passwd HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    assert!(closed_without_response(&mut stream));
}

#[test]
fn test_slow_client_request_timeout() {
    let server = TestServer::start(48167, 300, 10_000);
    let mut stream = server.connect();
    stream.write_all(b"GET /health HTTP/1.1\r\n").unwrap();

    let started = Instant::now();
    assert!(closed_without_response(&mut stream));
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(200) && elapsed < Duration::from_secs(3),
        "closed after {:?}",
        elapsed
    );
}

#[test]
fn test_idle_keep_alive_timeout() {
    let server = TestServer::start(48168, 5000, 300);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.contains("Connection: keep-alive"));

    // Stay silent; the idle timer must close the connection.
    assert_closed(&mut stream);
}

#[test]
fn test_request_size_boundary() {
    let server = TestServer::start(48169, 5000, 10_000);

    let base = b"GET /health HTTP/1.1\r\nHost: h\r\nX-Pad: ".len() + b"\r\n\r\n".len();
    let pad = 8192 - base;

    // Exactly 8192 bytes of headers: accepted.
    let mut request = Vec::new();
    request.extend_from_slice(b"GET /health HTTP/1.1\r\nHost: h\r\nX-Pad: ");
    request.extend(std::iter::repeat(b'a').take(pad));
    request.extend_from_slice(b"\r\n\r\n");
    assert_eq!(request.len(), 8192);

    let mut stream = server.connect();
    stream.write_all(&request).unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);

    // One byte over: closed without a response.
    let mut request = Vec::new();
    request.extend_from_slice(b"GET /health HTTP/1.1\r\nHost: h\r\nX-Pad: ");
    request.extend(std::iter::repeat(b'a').take(pad + 1));
    request.extend_from_slice(b"\r\n\r\n");
    assert_eq!(request.len(), 8193);

    let mut stream = server.connect();
    stream.write_all(&request).unwrap();
    assert!(closed_without_response(&mut stream));
}

#[test]
fn test_target_length_boundary() {
    let server = TestServer::start(48170, 5000, 10_000);

    // 255-byte target: parses, unregistered, 404.
    let path: String = std::iter::once('/')
        .chain(std::iter::repeat('a').take(254))
        .collect();
    assert_eq!(path.len(), 255);
    let mut stream = server.connect();
    stream
        .write_all(format!("GET {} HTTP/1.1\r\nHost: h\r\n\r\n", path).as_bytes())
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "head: {}", head);

    // 256 bytes: invalid target, closed with no response.
    let path = format!("{}a", path);
    let mut stream = server.connect();
    stream
        .write_all(format!("GET {} HTTP/1.1\r\nHost: h\r\n\r\n", path).as_bytes())
        .unwrap();
    assert!(closed_without_response(&mut stream));
}
