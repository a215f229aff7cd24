// src/pool.rs
use crate::conn::{Conn, ConnState};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Per-worker connection pool: a fixed slab of records and a LIFO stack of
/// free indices. Worker-local, so no atomics anywhere on this path. LIFO so
/// the most recently released record is reused next while its lines are
/// still warm.
pub struct ConnSlab {
    conns: Box<[Conn]>,
    free: Vec<u32>,
}

impl ConnSlab {
    /// Allocates every record up front; nothing allocates after this.
    pub fn new(capacity: usize) -> Self {
        let mut conns = Vec::with_capacity(capacity);
        conns.resize_with(capacity, Conn::empty);
        let free: Vec<u32> = (0..capacity as u32).rev().collect();
        Self {
            conns: conns.into_boxed_slice(),
            free,
        }
    }

    /// O(1): pops a free index and scrubs the record. `None` when exhausted.
    #[inline]
    pub fn acquire(&mut self) -> Option<usize> {
        let idx = self.free.pop()? as usize;
        self.conns[idx].reset_for_acquire();
        Some(idx)
    }

    /// O(1): returns the record to the free stack. Idempotent for records
    /// already Free.
    #[inline]
    pub fn release(&mut self, idx: usize) {
        let Some(conn) = self.conns.get_mut(idx) else {
            return;
        };
        if conn.state == ConnState::Free {
            return;
        }
        conn.state = ConnState::Free;
        conn.fd = -1;
        conn.timer = None;
        self.free.push(idx as u32);
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Conn> {
        self.conns.get(idx)
    }

    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Conn> {
        self.conns.get_mut(idx)
    }

    pub fn capacity(&self) -> usize {
        self.conns.len()
    }

    pub fn in_use(&self) -> usize {
        self.conns.len() - self.free.len()
    }
}

const NIL: u32 = u32::MAX;

/// Process-global fallback pool, used only when a worker's local slab is
/// exhausted. A lock-free stack of record indices threaded through a side
/// array: each record's free-list successor lives in `next`, and `head`
/// packs (version, index) into one atomic word. The version increments on
/// every successful push or pop, so a CAS can only succeed when nothing
/// happened in between — index reuse cannot forge an ABA match. Pop carries
/// acquire ordering and push release ordering, publishing the releasing
/// worker's record writes to the next acquirer.
///
/// Ownership protocol: a popped index belongs to exactly one worker until it
/// is pushed back. Workers tag fallback tokens so stale epoll events cannot
/// alias a local slab index.
pub struct FallbackPool {
    conns: Box<[UnsafeCell<Conn>]>,
    next: Box<[AtomicU32]>,
    head: AtomicU64,
}

// Safety: concurrent access to a given `conns` slot is serialized by the
// stack — only the worker that popped the slot's index touches the record,
// and the push/pop orderings publish its writes before the next pop.
unsafe impl Sync for FallbackPool {}

impl FallbackPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity < NIL as usize);
        let mut conns = Vec::with_capacity(capacity);
        conns.resize_with(capacity, || UnsafeCell::new(Conn::empty()));
        let next: Vec<AtomicU32> = (0..capacity as u32)
            .map(|i| AtomicU32::new(if i + 1 == capacity as u32 { NIL } else { i + 1 }))
            .collect();
        let head = AtomicU64::new(if capacity == 0 { NIL as u64 } else { 0 });
        Self {
            conns: conns.into_boxed_slice(),
            next: next.into_boxed_slice(),
            head,
        }
    }

    /// Pops a record index and scrubs the record. `None` when exhausted.
    pub fn acquire(&self) -> Option<u32> {
        let idx = self.pop()?;
        // Safety: the pop transferred exclusive ownership of slot `idx` to
        // this thread.
        let conn = unsafe { &mut *self.conns[idx as usize].get() };
        conn.reset_for_acquire();
        Some(idx)
    }

    /// Returns a record to the pool. Idempotent for records already Free.
    pub fn release(&self, idx: usize) {
        if idx >= self.conns.len() {
            return;
        }
        // Safety: the caller still owns the record it acquired; ownership
        // transfers back on the push below.
        let conn = unsafe { &mut *self.conns[idx].get() };
        if conn.state == ConnState::Free {
            return;
        }
        conn.state = ConnState::Free;
        conn.fd = -1;
        conn.timer = None;
        self.push(idx as u32);
    }

    /// Mutable access to an owned record.
    ///
    /// # Safety
    /// The caller must have acquired `idx` and not yet released it; no other
    /// reference to the record may exist.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn conn_mut(&self, idx: usize) -> Option<&mut Conn> {
        self.conns.get(idx).map(|c| &mut *c.get())
    }

    /// Read-only pointer for prefetching; never dereferenced by callers.
    pub fn conn_ptr(&self, idx: usize) -> Option<*const Conn> {
        self.conns.get(idx).map(|c| c.get() as *const Conn)
    }

    pub fn capacity(&self) -> usize {
        self.conns.len()
    }

    fn pop(&self) -> Option<u32> {
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let idx = (cur & 0xFFFF_FFFF) as u32;
            if idx == NIL {
                return None;
            }
            let next = self.next[idx as usize].load(Ordering::Relaxed);
            let new = bump_version(cur) | u64::from(next);
            match self
                .head
                .compare_exchange_weak(cur, new, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return Some(idx),
                Err(observed) => cur = observed,
            }
        }
    }

    fn push(&self, idx: u32) {
        let mut cur = self.head.load(Ordering::Relaxed);
        loop {
            // Only this thread writes `next[idx]`: it owns the record.
            self.next[idx as usize].store((cur & 0xFFFF_FFFF) as u32, Ordering::Relaxed);
            let new = bump_version(cur) | u64::from(idx);
            match self
                .head
                .compare_exchange_weak(cur, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }
}

#[inline]
fn bump_version(head: u64) -> u64 {
    ((head >> 32).wrapping_add(1)) << 32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_slab_acquire_release() {
        let mut slab = ConnSlab::new(4);
        assert_eq!(slab.capacity(), 4);
        assert_eq!(slab.in_use(), 0);

        let a = slab.acquire().unwrap();
        assert_eq!(slab.get(a).unwrap().state, ConnState::Reading);
        assert_eq!(slab.get(a).unwrap().fd, -1);
        assert_eq!(slab.in_use(), 1);

        slab.release(a);
        assert_eq!(slab.get(a).unwrap().state, ConnState::Free);
        assert_eq!(slab.in_use(), 0);

        // LIFO: the record just released comes back first.
        let b = slab.acquire().unwrap();
        assert_eq!(b, a);
    }

    #[test]
    fn test_slab_double_release_is_noop() {
        let mut slab = ConnSlab::new(2);
        let a = slab.acquire().unwrap();
        slab.release(a);
        slab.release(a);
        slab.release(99); // out of range, also a no-op
        assert_eq!(slab.in_use(), 0);

        // The free stack must not contain duplicates after the double free.
        let x = slab.acquire().unwrap();
        let y = slab.acquire().unwrap();
        assert_ne!(x, y);
        assert!(slab.acquire().is_none());
    }

    #[test]
    fn test_slab_exhaustion_and_recovery() {
        let mut slab = ConnSlab::new(3);
        let all: HashSet<usize> = (0..3).map(|_| slab.acquire().unwrap()).collect();
        assert_eq!(all.len(), 3);
        assert!(slab.acquire().is_none());

        for &i in &all {
            slab.release(i);
        }
        let again: HashSet<usize> = (0..3).map(|_| slab.acquire().unwrap()).collect();
        assert_eq!(again, all, "released set equals reacquired set");
    }

    #[test]
    fn test_fallback_basic() {
        let pool = FallbackPool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert!(pool.acquire().is_none());
        pool.release(a as usize);
        assert_eq!(pool.acquire(), Some(a));
    }

    #[test]
    fn test_fallback_double_release_is_noop() {
        let pool = FallbackPool::new(2);
        let a = pool.acquire().unwrap();
        pool.release(a as usize);
        pool.release(a as usize);
        let x = pool.acquire().unwrap();
        let y = pool.acquire().unwrap();
        assert_ne!(x, y);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_fallback_no_double_ownership_across_threads() {
        const CAP: usize = 64;
        const ROUNDS: usize = 10_000;
        let pool = Arc::new(FallbackPool::new(CAP));
        let owned: Arc<Vec<AtomicBool>> =
            Arc::new((0..CAP).map(|_| AtomicBool::new(false)).collect());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let owned = owned.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    if let Some(idx) = pool.acquire() {
                        let was = owned[idx as usize].swap(true, Ordering::SeqCst);
                        assert!(!was, "index {} handed to two owners", idx);
                        owned[idx as usize].store(false, Ordering::SeqCst);
                        pool.release(idx as usize);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // No leaks: the full capacity is still acquirable.
        let all: HashSet<u32> = (0..CAP).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(all.len(), CAP);
    }
}
