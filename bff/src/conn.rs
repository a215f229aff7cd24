// src/conn.rs
use crate::parser::{Method, MAX_TARGET_LEN};
use crate::timer::TimerHandle;
use std::net::SocketAddr;
use std::time::Instant;

/// Request ceiling. The read buffer is sized to it so the buffer-full check
/// and the oversized-request check coincide.
pub const MAX_REQUEST_SIZE: usize = 8192;
pub const READ_BUF_SIZE: usize = MAX_REQUEST_SIZE;
pub const HEADER_SCRATCH_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Free = 0,
    Reading = 1,
    Writing = 2,
    KeepAlive = 3,
    Closing = 4,
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState::Free
    }
}

/// A connection record. Allocated once at pool construction and reused for
/// the lifetime of the worker; the pools hand out indices, never ownership.
///
/// The response is a two-segment scatter list: the formatted header block in
/// `header_buf[..header_len]` followed by the static route `body`.
/// `bytes_sent` is a cumulative offset into the concatenation of the two.
#[repr(C, align(64))]
pub struct Conn {
    pub fd: i32,
    pub state: ConnState,
    pub keep_alive: bool,
    pub method: Method,
    pub target_len: u8,
    pub bytes_read: u32,
    pub header_len: u32,
    pub bytes_sent: u32,
    pub body: &'static [u8],
    pub timer: Option<TimerHandle>,
    pub peer: Option<SocketAddr>,
    pub last_active: Instant,
    pub target: [u8; MAX_TARGET_LEN],
    pub read_buf: [u8; READ_BUF_SIZE],
    pub header_buf: [u8; HEADER_SCRATCH_SIZE],
}

impl Conn {
    /// A fresh unused connection slot.
    pub fn empty() -> Self {
        Self {
            fd: -1,
            state: ConnState::Free,
            keep_alive: false,
            method: Method::Unknown,
            target_len: 0,
            bytes_read: 0,
            header_len: 0,
            bytes_sent: 0,
            body: b"",
            timer: None,
            peer: None,
            last_active: Instant::now(),
            target: [0; MAX_TARGET_LEN],
            read_buf: [0; READ_BUF_SIZE],
            header_buf: [0; HEADER_SCRATCH_SIZE],
        }
    }

    /// Scrub performed by the pools on acquire. The caller installs the fd
    /// and peer address afterwards. Buffer contents are reused as-is; the
    /// length counters are what make stale bytes unreachable.
    pub fn reset_for_acquire(&mut self) {
        self.fd = -1;
        self.state = ConnState::Reading;
        self.keep_alive = false;
        self.method = Method::Unknown;
        self.target_len = 0;
        self.bytes_read = 0;
        self.header_len = 0;
        self.bytes_sent = 0;
        self.body = b"";
        self.timer = None;
        self.peer = None;
        self.last_active = Instant::now();
    }

    /// Reset between keep-alive requests: request-observable state must match
    /// the record immediately after acquire. fd, peer and last_active persist.
    pub fn reset_for_next_request(&mut self) {
        self.keep_alive = false;
        self.method = Method::Unknown;
        self.target_len = 0;
        self.bytes_read = 0;
        self.header_len = 0;
        self.bytes_sent = 0;
        self.body = b"";
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::empty()
    }
}
