//! Mock I/O engine for tests
//!
//! Completes operations without touching the kernel. Two personalities:
//! synchronous (every `queue` returns `Completed`) and queued (units sit in
//! the submission queue until `commit`, then surface through `getevents`).
//! Failures, partial transfers and queue-full backpressure are injectable.

use super::{Ddir, EngineFlags, IoEngine, IoEvent, QueueResult, SubmittedIo};
use crate::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Record of one submitted operation, kept for assertions
#[derive(Debug, Clone)]
pub struct OpRecord {
    pub ddir: Ddir,
    pub fd: i32,
    pub offset: u64,
    pub len: usize,
    pub unit: usize,
}

/// Configurable in-memory engine
pub struct MockEngine {
    queued: bool,
    depth: usize,
    submitted: VecDeque<IoEvent>,
    committed: VecDeque<IoEvent>,
    reaped: Vec<IoEvent>,
    // Shared so tests keep visibility after the engine moves into a worker
    records: Arc<Mutex<Vec<OpRecord>>>,
    fail_with: Option<i32>,
    short_by: usize,
    busy_after: Option<usize>,
}

impl MockEngine {
    /// Synchronous personality: `queue` completes immediately.
    pub fn new() -> Self {
        Self {
            queued: false,
            depth: 1,
            submitted: VecDeque::new(),
            committed: VecDeque::new(),
            reaped: Vec::new(),
            records: Arc::new(Mutex::new(Vec::new())),
            fail_with: None,
            short_by: 0,
            busy_after: None,
        }
    }

    /// Queued personality: units complete only after `commit` + `getevents`.
    pub fn queued() -> Self {
        Self {
            queued: true,
            ..Self::new()
        }
    }

    /// Fail every subsequent operation with this errno.
    pub fn fail_with(&mut self, errno: i32) {
        self.fail_with = Some(errno);
    }

    /// Complete operations short by this many bytes.
    pub fn short_by(&mut self, bytes: usize) {
        self.short_by = bytes;
    }

    /// Return `Busy` once this many units sit unqueued (queued mode only).
    pub fn busy_after(&mut self, n: usize) {
        self.busy_after = Some(n);
    }

    pub fn records(&self) -> Vec<OpRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Handle that stays valid after the engine moves into a worker.
    pub fn records_handle(&self) -> Arc<Mutex<Vec<OpRecord>>> {
        Arc::clone(&self.records)
    }

    fn complete(&self, io: &SubmittedIo) -> std::result::Result<usize, i32> {
        if let Some(errno) = self.fail_with {
            return Err(errno);
        }
        if io.ddir.is_sync() {
            return Ok(0);
        }
        Ok(io.len.saturating_sub(self.short_by))
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IoEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn flags(&self) -> EngineFlags {
        EngineFlags {
            sync_io: !self.queued,
            needs_commit: self.queued,
        }
    }

    fn init(&mut self, iodepth: usize) -> Result<()> {
        self.depth = iodepth;
        Ok(())
    }

    fn queue(&mut self, io: SubmittedIo) -> Result<QueueResult> {
        if self.queued {
            if let Some(limit) = self.busy_after {
                if self.submitted.len() >= limit {
                    return Ok(QueueResult::Busy);
                }
            }
            if self.submitted.len() + self.committed.len() >= self.depth {
                return Ok(QueueResult::Busy);
            }
        }

        self.records.lock().unwrap().push(OpRecord {
            ddir: io.ddir,
            fd: io.fd,
            offset: io.offset,
            len: io.len,
            unit: io.unit,
        });

        let result = self.complete(&io);
        let event = IoEvent {
            unit: io.unit,
            ddir: io.ddir,
            result,
        };

        if self.queued {
            self.submitted.push_back(event);
            Ok(QueueResult::Queued)
        } else {
            Ok(QueueResult::Completed(event.result))
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.committed.append(&mut self.submitted);
        Ok(())
    }

    fn getevents(&mut self, min: usize, max: usize, _timeout: Option<Duration>) -> Result<usize> {
        let want = self.committed.len().min(max).max(min.min(self.committed.len()));
        self.reaped.clear();
        for _ in 0..want {
            if let Some(ev) = self.committed.pop_front() {
                self.reaped.push(ev);
            }
        }
        Ok(self.reaped.len())
    }

    fn event(&mut self, idx: usize) -> IoEvent {
        self.reaped[idx].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io(unit: usize, offset: u64) -> SubmittedIo {
        SubmittedIo {
            ddir: Ddir::Write,
            fd: 3,
            offset,
            buf: std::ptr::null_mut(),
            len: 4096,
            unit,
        }
    }

    #[test]
    fn test_sync_personality_completes() {
        let mut engine = MockEngine::new();
        engine.init(4).unwrap();
        match engine.queue(io(7, 0)).unwrap() {
            QueueResult::Completed(Ok(n)) => assert_eq!(n, 4096),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(engine.records().len(), 1);
        assert_eq!(engine.records()[0].unit, 7);
    }

    #[test]
    fn test_queued_personality_needs_commit() {
        let mut engine = MockEngine::queued();
        engine.init(4).unwrap();

        assert!(matches!(engine.queue(io(0, 0)).unwrap(), QueueResult::Queued));
        assert!(matches!(engine.queue(io(1, 4096)).unwrap(), QueueResult::Queued));

        // Nothing reapable before commit
        assert_eq!(engine.getevents(0, 8, None).unwrap(), 0);

        engine.commit().unwrap();
        assert_eq!(engine.getevents(1, 8, None).unwrap(), 2);
        assert_eq!(engine.event(0).unit, 0);
        assert_eq!(engine.event(1).unit, 1);
    }

    #[test]
    fn test_busy_at_depth() {
        let mut engine = MockEngine::queued();
        engine.init(2).unwrap();
        assert!(matches!(engine.queue(io(0, 0)).unwrap(), QueueResult::Queued));
        assert!(matches!(engine.queue(io(1, 0)).unwrap(), QueueResult::Queued));
        assert!(matches!(engine.queue(io(2, 0)).unwrap(), QueueResult::Busy));
    }

    #[test]
    fn test_failure_injection() {
        let mut engine = MockEngine::new();
        engine.fail_with(libc::EIO);
        match engine.queue(io(0, 0)).unwrap() {
            QueueResult::Completed(Err(errno)) => assert_eq!(errno, libc::EIO),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_short_transfer_injection() {
        let mut engine = MockEngine::new();
        engine.short_by(512);
        match engine.queue(io(0, 0)).unwrap() {
            QueueResult::Completed(Ok(n)) => assert_eq!(n, 4096 - 512),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
