//! I/O unit pool
//!
//! Pre-allocated request objects, one per slot of `iodepth`, cycling through
//! three lists: free, busy (in flight or held for verification), and
//! requeues (partial transfers and engine pushback go back to the front of
//! the line). At every observable instant
//! `|free| + |busy| + |requeue| == capacity`.
//!
//! The pool is internally synchronized. With `verify_async` off the lock is
//! worker-private and uncontended; with it on, verifier threads return units
//! through the same lock and `get` parks on the free condition until a slot
//! comes back.

use crate::engine::Ddir;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One in-flight request
#[derive(Debug, Clone)]
pub struct IoUnit {
    /// Arena index of this unit; doubles as its buffer slice index
    pub index: usize,
    pub ddir: Ddir,
    /// Arena index of the target file
    pub file: usize,
    pub offset: u64,
    pub len: u64,
    /// Extent as originally prepared; partial retries advance offset/len
    /// but payload regeneration stays anchored here
    pub orig_offset: u64,
    pub orig_len: u64,
    /// Allocation time; submission latency baseline
    pub start_time: Option<Instant>,
    /// Submission time; completion latency baseline
    pub issue_time: Option<Instant>,
    /// Bytes actually transferred
    pub res: u64,
    /// errno of a failed transfer, 0 otherwise
    pub error: i32,
    /// Block seed for seeded verify payloads
    pub verify_seed: u64,
    /// Write sequence number for verify meta mode
    pub seq: u64,
}

impl IoUnit {
    fn blank(index: usize) -> Self {
        Self {
            index,
            ddir: Ddir::Read,
            file: 0,
            offset: 0,
            len: 0,
            orig_offset: 0,
            orig_len: 0,
            start_time: None,
            issue_time: None,
            res: 0,
            error: 0,
            verify_seed: 0,
            seq: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Free,
    Busy,
    Requeued,
}

#[derive(Debug)]
struct PoolInner {
    units: Vec<IoUnit>,
    state: Vec<UnitState>,
    free: VecDeque<usize>,
    requeues: VecDeque<usize>,
    busy: usize,
}

/// The pool itself; shared with verifier threads via `Arc` when offload is on
#[derive(Debug)]
pub struct IoUnitPool {
    inner: Mutex<PoolInner>,
    free_cond: Condvar,
    capacity: usize,
}

impl IoUnitPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let units = (0..capacity).map(IoUnit::blank).collect();
        Self {
            inner: Mutex::new(PoolInner {
                units,
                state: vec![UnitState::Free; capacity],
                free: (0..capacity).collect(),
                requeues: VecDeque::new(),
                busy: 0,
            }),
            free_cond: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate a unit: requeues first, then the freelist. Blocks up to
    /// `timeout` for a completion (or a verifier release) to signal a slot.
    /// The returned unit is already on the busy list; the flag reports a
    /// requeued unit, which keeps its fields and is retried as-is.
    pub fn get(&self, timeout: Duration) -> Option<(usize, bool)> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(idx) = inner.requeues.pop_front() {
                inner.state[idx] = UnitState::Busy;
                inner.busy += 1;
                return Some((idx, true));
            }
            if let Some(idx) = inner.free.pop_front() {
                inner.state[idx] = UnitState::Busy;
                inner.busy += 1;
                let unit = &mut inner.units[idx];
                *unit = IoUnit::blank(idx);
                unit.start_time = Some(Instant::now());
                return Some((idx, false));
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, res) = self
                .free_cond
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if res.timed_out() && inner.free.is_empty() && inner.requeues.is_empty() {
                return None;
            }
        }
    }

    /// Fill in the workload fields of a freshly allocated unit.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &self,
        idx: usize,
        ddir: Ddir,
        file: usize,
        offset: u64,
        len: u64,
        verify_seed: u64,
        seq: u64,
    ) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state[idx], UnitState::Busy);
        let unit = &mut inner.units[idx];
        unit.ddir = ddir;
        unit.file = file;
        unit.offset = offset;
        unit.len = len;
        unit.orig_offset = offset;
        unit.orig_len = len;
        unit.verify_seed = verify_seed;
        unit.seq = seq;
        unit.res = 0;
        unit.error = 0;
    }

    /// Stamp the submission timestamp when the engine accepts the unit.
    pub fn mark_submitted(&self, idx: usize, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.units[idx].issue_time = Some(now);
    }

    /// Record the completion result but keep the unit busy (verification
    /// still owns it). The snapshot is returned for stats.
    pub fn settle(&self, idx: usize, result: Result<u64, i32>) -> IoUnit {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state[idx], UnitState::Busy);
        let unit = &mut inner.units[idx];
        match result {
            Ok(bytes) => unit.res = bytes,
            Err(errno) => unit.error = errno,
        }
        unit.clone()
    }

    /// Complete a unit: record the result and return it to the freelist,
    /// waking one waiter. The final snapshot is returned for stats.
    pub fn complete(&self, idx: usize, result: Result<u64, i32>) -> IoUnit {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state[idx], UnitState::Busy);
        let unit = &mut inner.units[idx];
        match result {
            Ok(bytes) => unit.res = bytes,
            Err(errno) => unit.error = errno,
        }
        let snapshot = unit.clone();
        inner.state[idx] = UnitState::Free;
        inner.busy -= 1;
        inner.free.push_back(idx);
        drop(inner);
        self.free_cond.notify_one();
        snapshot
    }

    /// Release a busy unit without touching its result (verifier done with
    /// it, or an unused allocation being discarded).
    pub fn release(&self, idx: usize) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state[idx], UnitState::Busy);
        inner.state[idx] = UnitState::Free;
        inner.busy -= 1;
        inner.free.push_back(idx);
        drop(inner);
        self.free_cond.notify_one();
    }

    /// Consume `bytes` of a partially transferred unit and requeue the
    /// remainder. The original extent stays recorded for regeneration.
    pub fn advance_and_requeue(&self, idx: usize, bytes: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.state[idx], UnitState::Busy);
            let unit = &mut inner.units[idx];
            debug_assert!(bytes < unit.len);
            unit.offset += bytes;
            unit.len -= bytes;
            unit.res = 0;
        }
        self.requeue(idx);
    }

    /// Push a busy unit onto the requeue list (partial transfer, engine
    /// pushback). It is retried ahead of fresh allocations.
    pub fn requeue(&self, idx: usize) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state[idx], UnitState::Busy);
        inner.state[idx] = UnitState::Requeued;
        inner.busy -= 1;
        inner.requeues.push_back(idx);
    }

    /// Clone of a unit's current fields.
    pub fn snapshot(&self, idx: usize) -> IoUnit {
        self.inner.lock().unwrap().units[idx].clone()
    }

    pub fn free_len(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn busy_len(&self) -> usize {
        self.inner.lock().unwrap().busy
    }

    pub fn requeue_len(&self) -> usize {
        self.inner.lock().unwrap().requeues.len()
    }

    /// Current depth: units allocated and not yet back on the freelist.
    pub fn cur_depth(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.busy + inner.requeues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn assert_invariant(pool: &IoUnitPool) {
        assert_eq!(
            pool.free_len() + pool.busy_len() + pool.requeue_len(),
            pool.capacity()
        );
    }

    #[test]
    fn test_list_invariant_through_lifecycle() {
        let pool = IoUnitPool::new(4);
        assert_invariant(&pool);

        let (a, _) = pool.get(Duration::from_millis(10)).unwrap();
        let (b, _) = pool.get(Duration::from_millis(10)).unwrap();
        assert_invariant(&pool);
        assert_eq!(pool.busy_len(), 2);

        pool.requeue(a);
        assert_invariant(&pool);
        assert_eq!(pool.requeue_len(), 1);

        pool.complete(b, Ok(4096));
        assert_invariant(&pool);

        // Requeued unit comes back first.
        let (again, _) = pool.get(Duration::from_millis(10)).unwrap();
        assert_eq!(again, a);
        assert_invariant(&pool);

        pool.complete(again, Ok(4096));
        assert_invariant(&pool);
        assert_eq!(pool.free_len(), 4);
    }

    #[test]
    fn test_get_blocks_until_capacity() {
        let pool = IoUnitPool::new(2);
        let (_a, _) = pool.get(Duration::from_millis(10)).unwrap();
        let (_b, _) = pool.get(Duration::from_millis(10)).unwrap();
        // Depth at capacity: allocation times out.
        assert!(pool.get(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_get_wakes_on_complete() {
        let pool = Arc::new(IoUnitPool::new(1));
        let (held, _) = pool.get(Duration::from_millis(10)).unwrap();

        let p2 = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || p2.get(Duration::from_secs(5)));

        std::thread::sleep(Duration::from_millis(20));
        pool.complete(held, Ok(512));

        let got = waiter.join().unwrap();
        assert!(got.is_some());
    }

    #[test]
    fn test_prepare_and_snapshot() {
        let pool = IoUnitPool::new(2);
        let (idx, _) = pool.get(Duration::from_millis(10)).unwrap();
        pool.prepare(idx, Ddir::Write, 3, 8192, 4096, 0xfeed, 17);

        let unit = pool.snapshot(idx);
        assert_eq!(unit.ddir, Ddir::Write);
        assert_eq!(unit.file, 3);
        assert_eq!(unit.offset, 8192);
        assert_eq!(unit.len, 4096);
        assert_eq!(unit.verify_seed, 0xfeed);
        assert_eq!(unit.seq, 17);
        assert!(unit.start_time.is_some());
    }

    #[test]
    fn test_complete_records_result() {
        let pool = IoUnitPool::new(1);
        let (idx, _) = pool.get(Duration::from_millis(10)).unwrap();
        let unit = pool.complete(idx, Err(libc::EIO));
        assert_eq!(unit.error, libc::EIO);

        let (idx, _) = pool.get(Duration::from_millis(10)).unwrap();
        let unit = pool.complete(idx, Ok(2048));
        assert_eq!(unit.res, 2048);
        assert_eq!(unit.error, 0);
    }

    #[test]
    fn test_settle_keeps_unit_busy() {
        let pool = IoUnitPool::new(2);
        let (idx, _) = pool.get(Duration::from_millis(10)).unwrap();
        let unit = pool.settle(idx, Ok(4096));
        assert_eq!(unit.res, 4096);
        assert_eq!(pool.busy_len(), 1);

        pool.release(idx);
        assert_eq!(pool.busy_len(), 0);
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn test_cur_depth_counts_requeues() {
        let pool = IoUnitPool::new(4);
        let (a, _) = pool.get(Duration::from_millis(10)).unwrap();
        let (_b, _) = pool.get(Duration::from_millis(10)).unwrap();
        pool.requeue(a);
        assert_eq!(pool.cur_depth(), 2);
    }
}
