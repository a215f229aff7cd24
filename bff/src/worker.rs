// src/worker.rs
use crate::config::EngineConfig;
use crate::conn::{Conn, ConnState, MAX_REQUEST_SIZE, READ_BUF_SIZE};
use crate::dispatch;
use crate::metrics::{ErrorKind, WorkerMetrics};
use crate::parser;
use crate::pool::{ConnSlab, FallbackPool};
use crate::router::Router;
use crate::syscalls::{
    self, epoll_event, Epoll, EPOLLERR, EPOLLET, EPOLLEXCLUSIVE, EPOLLHUP, EPOLLIN, EPOLLONESHOT,
    EPOLLOUT, EPOLLRDHUP,
};
use crate::timer::TimerHeap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const LISTEN_TOKEN: u64 = u64::MAX;
/// Tokens with this bit address the global fallback pool instead of the
/// worker-local slab. Slab indices stay well below 2^32.
const FALLBACK_BIT: u64 = 1 << 32;

const MAX_EVENTS: usize = 2048;
const MAX_ACCEPTS_PER_LOOP: usize = 128;
const BATCH_SIZE: usize = 32;
const MAX_READ_ATTEMPTS: usize = 8;
const MAX_WRITE_ATTEMPTS: usize = 16;
const MAX_RESPONSE_SIZE: usize = 65536;
/// Upper bound on a single epoll wait; keeps shutdown-flag checks timely
/// when the timer heap is empty or far in the future.
const MAX_WAIT_MS: i32 = 500;

const READ_EVENTS: i32 = EPOLLIN | EPOLLET | EPOLLONESHOT | EPOLLRDHUP;
const WRITE_EVENTS: i32 = EPOLLOUT | EPOLLET | EPOLLONESHOT | EPOLLRDHUP;

pub struct Worker {
    id: usize,
    listen_fd: i32,
    router: Arc<Router>,
    metrics: Arc<WorkerMetrics>,
    fallback: Arc<FallbackPool>,
    cfg: EngineConfig,
}

/// Immutable per-worker context shared by the event-handling helpers.
struct Ctx<'a> {
    epoll: &'a Epoll,
    router: &'a Router,
    metrics: &'a WorkerMetrics,
    fallback: &'a FallbackPool,
    cfg: &'a EngineConfig,
    listen_fd: i32,
}

/// Mutable reactor state. Kept separate from `Ctx` so helpers can borrow
/// individual fields (slab vs. timers) without fighting over one `&mut self`.
struct ReactorState {
    slab: ConnSlab,
    timers: TimerHeap,
    /// Fallback-pool indices currently owned by this worker, for shutdown.
    fallback_live: Vec<u32>,
    read_batch: Vec<u64>,
    write_batch: Vec<u64>,
}

enum ReadOutcome {
    /// Headers incomplete; read readiness re-armed.
    AwaitMore,
    /// Request dispatched; the record is in Writing.
    Responded,
    Close(ErrorKind),
}

enum WriteOutcome {
    /// EAGAIN; write readiness armed.
    Pending,
    /// Response fully drained.
    Done { reuse: bool },
    Error(ErrorKind),
}

impl Worker {
    pub fn new(
        id: usize,
        listen_fd: i32,
        router: Arc<Router>,
        metrics: Arc<WorkerMetrics>,
        fallback: Arc<FallbackPool>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            id,
            listen_fd,
            router,
            metrics,
            fallback,
            cfg,
        }
    }

    pub fn run(&mut self, shutdown: Arc<AtomicBool>) {
        let epoll = match Epoll::new() {
            Ok(e) => e,
            Err(e) => {
                error!(worker = self.id, error = %e, "failed to create epoll instance");
                return;
            }
        };
        // Level-triggered with exclusive wakeup: one accept queue drain per
        // connection burst, on exactly one worker.
        if let Err(e) = epoll.add(self.listen_fd, LISTEN_TOKEN, EPOLLIN | EPOLLEXCLUSIVE) {
            error!(worker = self.id, error = %e, "failed to register listen socket");
            return;
        }

        let ctx = Ctx {
            epoll: &epoll,
            router: &self.router,
            metrics: &self.metrics,
            fallback: &self.fallback,
            cfg: &self.cfg,
            listen_fd: self.listen_fd,
        };
        let mut st = ReactorState {
            slab: ConnSlab::new(self.cfg.max_connections),
            timers: TimerHeap::new(self.cfg.max_connections + self.fallback.capacity()),
            fallback_live: Vec::new(),
            read_batch: Vec::with_capacity(BATCH_SIZE),
            write_batch: Vec::with_capacity(BATCH_SIZE),
        };
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut expired: Vec<u64> = Vec::with_capacity(128);

        info!(worker = self.id, "worker entering event loop");

        while !shutdown.load(Ordering::Acquire) {
            let timeout = match st.timers.next_timeout_ms(Instant::now()) {
                t if t < 0 => MAX_WAIT_MS,
                t => t.min(MAX_WAIT_MS),
            };
            let n = match ctx.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "epoll wait failed");
                    continue;
                }
            };

            expired.clear();
            st.timers.pop_expired(Instant::now(), &mut expired);
            for &tok in &expired {
                close_expired(&ctx, &mut st, tok);
            }

            for ev in events.iter().take(n) {
                let tok = ev.u64;
                let mask = ev.events;

                if tok == LISTEN_TOKEN {
                    if !shutdown.load(Ordering::Acquire) {
                        accept_batch(&ctx, &mut st);
                    }
                    continue;
                }

                let state = match lookup_conn(&mut st.slab, ctx.fallback, tok) {
                    Some(conn) => conn.state,
                    None => continue,
                };
                if matches!(state, ConnState::Free | ConnState::Closing) {
                    continue; // stale event from a prior life of this record
                }

                if mask & (EPOLLERR | EPOLLHUP | EPOLLRDHUP) as u32 != 0 {
                    let kind = if mask & EPOLLRDHUP as u32 != 0 {
                        ErrorKind::ClientDisconnect
                    } else {
                        ErrorKind::Io
                    };
                    ctx.metrics.inc_error(kind);
                    close_conn(&ctx, &mut st, tok);
                    continue;
                }

                if matches!(state, ConnState::Reading | ConnState::KeepAlive)
                    && mask & EPOLLIN as u32 != 0
                {
                    if st.read_batch.len() == BATCH_SIZE {
                        flush_batches(&ctx, &mut st);
                    }
                    st.read_batch.push(tok);
                }
                if state == ConnState::Writing && mask & EPOLLOUT as u32 != 0 {
                    if st.write_batch.len() == BATCH_SIZE {
                        flush_batches(&ctx, &mut st);
                    }
                    st.write_batch.push(tok);
                }
            }

            flush_batches(&ctx, &mut st);
        }

        // Graceful drain: finish in-flight batches, then tear everything down.
        flush_batches(&ctx, &mut st);
        let mut live: Vec<u64> = Vec::new();
        for i in 0..st.slab.capacity() {
            if let Some(conn) = st.slab.get(i) {
                if conn.state != ConnState::Free {
                    live.push(i as u64);
                }
            }
        }
        live.extend(st.fallback_live.iter().map(|&i| u64::from(i) | FALLBACK_BIT));
        for tok in live {
            close_conn(&ctx, &mut st, tok);
        }

        info!(worker = self.id, "worker exited event loop");
    }
}

fn lookup_conn<'a>(
    slab: &'a mut ConnSlab,
    fallback: &'a FallbackPool,
    tok: u64,
) -> Option<&'a mut Conn> {
    if tok == LISTEN_TOKEN {
        return None;
    }
    if tok & FALLBACK_BIT != 0 {
        // Safety: only this worker constructed the token, and a fallback
        // record is referenced by exactly one worker between acquire and
        // release.
        unsafe { fallback.conn_mut((tok ^ FALLBACK_BIT) as usize) }
    } else {
        slab.get_mut(tok as usize)
    }
}

fn conn_ptr(st: &ReactorState, fallback: &FallbackPool, tok: u64) -> Option<*const Conn> {
    if tok & FALLBACK_BIT != 0 {
        fallback.conn_ptr((tok ^ FALLBACK_BIT) as usize)
    } else {
        st.slab.get(tok as usize).map(|c| c as *const Conn)
    }
}

#[inline(always)]
fn prefetch(conn: *const Conn) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(conn as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = conn;
}

/// Drain the accept queue, up to a batch cap so one flood cannot starve the
/// connections already being served. The listener is level-triggered, so a
/// capped drain resumes on the next wait.
fn accept_batch(ctx: &Ctx<'_>, st: &mut ReactorState) {
    for _ in 0..MAX_ACCEPTS_PER_LOOP {
        let (fd, peer) = match syscalls::accept_connection(ctx.listen_fd) {
            Ok(Some(pair)) => pair,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "accept failed");
                break;
            }
        };
        syscalls::configure_client_socket(fd);

        let tok = match st.slab.acquire() {
            Some(idx) => idx as u64,
            None => match ctx.fallback.acquire() {
                Some(idx) => {
                    st.fallback_live.push(idx);
                    u64::from(idx) | FALLBACK_BIT
                }
                None => {
                    ctx.metrics.inc_error(ErrorKind::Exhausted);
                    warn!("connection pools exhausted, dropping accepted socket");
                    syscalls::close_fd(fd);
                    continue;
                }
            },
        };
        ctx.metrics.inc_conn();

        if let Some(conn) = lookup_conn(&mut st.slab, ctx.fallback, tok) {
            conn.fd = fd;
            conn.peer = peer;
            conn.last_active = Instant::now();
        }

        if let Err(e) = ctx.epoll.add(fd, tok, READ_EVENTS) {
            debug!(error = %e, "failed to register accepted socket");
            ctx.metrics.inc_error(ErrorKind::Io);
            close_conn(ctx, st, tok);
            continue;
        }

        if !arm_request_timer(ctx, st, tok) {
            ctx.metrics.inc_error(ErrorKind::Exhausted);
            close_conn(ctx, st, tok);
        }
    }
}

fn arm_request_timer(ctx: &Ctx<'_>, st: &mut ReactorState, tok: u64) -> bool {
    match st.timers.add(tok, ctx.cfg.request_timeout, Instant::now()) {
        Some(handle) => {
            if let Some(conn) = lookup_conn(&mut st.slab, ctx.fallback, tok) {
                conn.timer = Some(handle);
            }
            true
        }
        None => false,
    }
}

/// A timer fired for `tok`. The heap entry is already gone; close the
/// connection unless it was already released.
fn close_expired(ctx: &Ctx<'_>, st: &mut ReactorState, tok: u64) {
    let live = match lookup_conn(&mut st.slab, ctx.fallback, tok) {
        Some(conn) if !matches!(conn.state, ConnState::Free | ConnState::Closing) => {
            conn.timer = None;
            true
        }
        _ => false,
    };
    if live {
        ctx.metrics.inc_error(ErrorKind::Timeout);
        close_conn(ctx, st, tok);
    }
}

/// The single close procedure: deregister, close the socket, cancel the
/// timer, return the record to its owning pool. Safe to call with a token
/// whose record is already Free.
fn close_conn(ctx: &Ctx<'_>, st: &mut ReactorState, tok: u64) {
    let (fd, timer) = match lookup_conn(&mut st.slab, ctx.fallback, tok) {
        Some(conn) if conn.state != ConnState::Free => {
            conn.state = ConnState::Closing;
            (conn.fd, conn.timer.take())
        }
        _ => return,
    };

    if let Some(handle) = timer {
        st.timers.cancel(handle);
    }
    if fd >= 0 {
        let _ = ctx.epoll.delete(fd);
        syscalls::close_fd(fd);
    }

    if tok & FALLBACK_BIT != 0 {
        let idx = (tok ^ FALLBACK_BIT) as u32;
        if let Some(pos) = st.fallback_live.iter().position(|&x| x == idx) {
            st.fallback_live.swap_remove(pos);
        }
        ctx.fallback.release(idx as usize);
    } else {
        st.slab.release(tok as usize);
    }
    ctx.metrics.dec_conn();
}

/// Process the deferred micro-batches: reads first, and any connection that
/// completed a request joins the write batch of the same iteration.
fn flush_batches(ctx: &Ctx<'_>, st: &mut ReactorState) {
    let mut batch = std::mem::take(&mut st.read_batch);
    for i in 0..batch.len() {
        if i + 1 < batch.len() {
            if let Some(ptr) = conn_ptr(st, ctx.fallback, batch[i + 1]) {
                prefetch(ptr);
            }
        }
        if run_read(ctx, st, batch[i]) {
            st.write_batch.push(batch[i]);
        }
    }
    batch.clear();
    st.read_batch = batch;

    let mut batch = std::mem::take(&mut st.write_batch);
    for i in 0..batch.len() {
        if i + 1 < batch.len() {
            if let Some(ptr) = conn_ptr(st, ctx.fallback, batch[i + 1]) {
                prefetch(ptr);
            }
        }
        run_write(ctx, st, batch[i]);
    }
    batch.clear();
    st.write_batch = batch;
}

/// Returns true when the connection completed a request and should be
/// queued for writing.
fn run_read(ctx: &Ctx<'_>, st: &mut ReactorState, tok: u64) -> bool {
    let Some(conn) = lookup_conn(&mut st.slab, ctx.fallback, tok) else {
        return false;
    };
    if !matches!(conn.state, ConnState::Reading | ConnState::KeepAlive) {
        return false;
    }
    match do_read(ctx, conn, &mut st.timers, tok) {
        ReadOutcome::Responded => {
            ctx.metrics.inc_req();
            true
        }
        ReadOutcome::AwaitMore => false,
        ReadOutcome::Close(kind) => {
            ctx.metrics.inc_error(kind);
            close_conn(ctx, st, tok);
            false
        }
    }
}

fn run_write(ctx: &Ctx<'_>, st: &mut ReactorState, tok: u64) {
    let Some(conn) = lookup_conn(&mut st.slab, ctx.fallback, tok) else {
        return;
    };
    if conn.state != ConnState::Writing {
        return;
    }
    match do_write(ctx, conn, &mut st.timers, tok) {
        WriteOutcome::Pending => {}
        WriteOutcome::Done { reuse: true } => {}
        WriteOutcome::Done { reuse: false } => close_conn(ctx, st, tok),
        WriteOutcome::Error(kind) => {
            ctx.metrics.inc_error(kind);
            close_conn(ctx, st, tok);
        }
    }
}

fn do_read(
    ctx: &Ctx<'_>,
    conn: &mut Conn,
    timers: &mut TimerHeap,
    tok: u64,
) -> ReadOutcome {
    if conn.state == ConnState::KeepAlive {
        // First byte of the next request: swap the idle timer for a fresh
        // request timer.
        conn.state = ConnState::Reading;
        if let Some(handle) = conn.timer.take() {
            timers.cancel(handle);
        }
        match timers.add(tok, ctx.cfg.request_timeout, Instant::now()) {
            Some(handle) => conn.timer = Some(handle),
            None => return ReadOutcome::Close(ErrorKind::Exhausted),
        }
    }
    conn.last_active = Instant::now();

    let mut attempts = 0;
    loop {
        let used = conn.bytes_read as usize;
        if used >= READ_BUF_SIZE {
            // Buffer holds a full-ceiling request; whether it terminates is
            // decided by the scan below.
            break;
        }
        match syscalls::recv(conn.fd, &mut conn.read_buf[used..]) {
            Ok(0) => return ReadOutcome::Close(ErrorKind::ClientDisconnect),
            Ok(n) => {
                if parser::contains_ctl(&conn.read_buf[used..used + n]) {
                    return ReadOutcome::Close(ErrorKind::Protocol);
                }
                conn.bytes_read += n as u32;
                if conn.bytes_read as usize > MAX_REQUEST_SIZE {
                    return ReadOutcome::Close(ErrorKind::Protocol);
                }
                if ctx.cfg.repeat_guard
                    && conn.bytes_read > 1024
                    && parser::has_repeated_run(&conn.read_buf[..conn.bytes_read as usize])
                {
                    return ReadOutcome::Close(ErrorKind::Protocol);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return ReadOutcome::Close(ErrorKind::Io),
        }
        attempts += 1;
        if attempts >= MAX_READ_ATTEMPTS {
            break;
        }
    }

    let len = conn.bytes_read as usize;
    let Some(end) = parser::find_header_end(&conn.read_buf[..len]) else {
        if len >= MAX_REQUEST_SIZE {
            return ReadOutcome::Close(ErrorKind::Protocol);
        }
        if ctx.epoll.modify(conn.fd, tok, READ_EVENTS).is_err() {
            return ReadOutcome::Close(ErrorKind::Io);
        }
        return ReadOutcome::AwaitMore;
    };

    let head_len = end + 4;
    if head_len < len {
        // Bytes past the terminator: pipelining is not supported.
        return ReadOutcome::Close(ErrorKind::Protocol);
    }

    match parser::parse_request(&conn.read_buf[..head_len]) {
        Ok(req) => {
            conn.target[..req.target.len()].copy_from_slice(req.target);
            conn.target_len = req.target.len() as u8;
            conn.method = req.method;
            conn.keep_alive = req.keep_alive;
        }
        Err(e) => {
            debug!(error = ?e, "request rejected");
            return ReadOutcome::Close(ErrorKind::Protocol);
        }
    }

    if let Some(handle) = conn.timer.take() {
        timers.cancel(handle);
    }
    if dispatch::prepare_response(conn, ctx.router, ctx.cfg.keep_alive_timeout.as_secs()) {
        ctx.metrics.inc_error(ErrorKind::Overflow);
    }
    ReadOutcome::Responded
}

fn do_write(
    ctx: &Ctx<'_>,
    conn: &mut Conn,
    timers: &mut TimerHeap,
    tok: u64,
) -> WriteOutcome {
    conn.last_active = Instant::now();

    let header_len = conn.header_len as usize;
    let total = header_len + conn.body.len();
    if total > MAX_RESPONSE_SIZE {
        return WriteOutcome::Error(ErrorKind::Overflow);
    }

    let mut attempts = 0;
    while (conn.bytes_sent as usize) < total {
        attempts += 1;
        if attempts > MAX_WRITE_ATTEMPTS {
            // A peer draining bytes this slowly is not worth carrying.
            return WriteOutcome::Error(ErrorKind::Io);
        }

        let sent = conn.bytes_sent as usize;
        let res = if sent < header_len {
            syscalls::writev_pair(conn.fd, &conn.header_buf[sent..header_len], conn.body)
        } else {
            syscalls::writev_pair(conn.fd, &conn.body[sent - header_len..], &[])
        };
        match res {
            Ok(n) => {
                conn.bytes_sent += n as u32;
                ctx.metrics.add_bytes(n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if ctx.epoll.modify(conn.fd, tok, WRITE_EVENTS).is_err() {
                    return WriteOutcome::Error(ErrorKind::Io);
                }
                return WriteOutcome::Pending;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return WriteOutcome::Error(ErrorKind::Io),
        }
    }

    if !conn.keep_alive {
        return WriteOutcome::Done { reuse: false };
    }

    // Reuse: back to a clean slate, wait for the next request.
    conn.reset_for_next_request();
    conn.state = ConnState::KeepAlive;
    if ctx.epoll.modify(conn.fd, tok, READ_EVENTS).is_err() {
        return WriteOutcome::Error(ErrorKind::Io);
    }
    match timers.add(tok, ctx.cfg.keep_alive_timeout, Instant::now()) {
        Some(handle) => conn.timer = Some(handle),
        None => return WriteOutcome::Error(ErrorKind::Exhausted),
    }
    WriteOutcome::Done { reuse: true }
}
