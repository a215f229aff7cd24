// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Error classes counted per worker. Every kind except transient EAGAIN
/// results in the affected connection being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientDisconnect,
    Io,
    Protocol,
    Timeout,
    Exhausted,
    Overflow,
}

#[repr(C, align(64))]
pub struct WorkerMetrics {
    pub req_count: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub client_disconnects: AtomicUsize,
    pub io_errors: AtomicUsize,
    pub protocol_errors: AtomicUsize,
    pub timeouts: AtomicUsize,
    pub exhaustions: AtomicUsize,
    pub overflows: AtomicUsize,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            client_disconnects: AtomicUsize::new(0),
            io_errors: AtomicUsize::new(0),
            protocol_errors: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
            exhaustions: AtomicUsize::new(0),
            overflows: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_error(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::ClientDisconnect => &self.client_disconnects,
            ErrorKind::Io => &self.io_errors,
            ErrorKind::Protocol => &self.protocol_errors,
            ErrorKind::Timeout => &self.timeouts,
            ErrorKind::Exhausted => &self.exhaustions,
            ErrorKind::Overflow => &self.overflows,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
