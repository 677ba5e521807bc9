//! I/O engine abstraction
//!
//! An engine is the pluggable backend that carries I/O units to the kernel
//! and reaps their completions. The worker drives every engine through the
//! same contract: `queue` accepts one unit (synchronous engines complete it
//! right there), `commit` flushes whatever was queued, `getevents`/`event`
//! reap and hand back completions. Engine internals are opaque to the rest
//! of the crate.
//!
//! Engines are discovered by name via [`create`]; each worker owns its own
//! instance, so implementations must be `Send` but not `Sync`.

use crate::Result;
use anyhow::bail;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub mod mock;
pub mod sync;

/// Direction of an I/O unit
///
/// `Read`/`Write`/`Trim` are data directions with per-direction accounting;
/// `Sync`/`Datasync` are interleaved flush operations that carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ddir {
    Read,
    Write,
    Trim,
    Sync,
    Datasync,
}

/// Number of data directions tracked by counters and histograms
pub const DDIR_COUNT: usize = 3;

impl Ddir {
    /// Index into per-direction arrays. Only valid for data directions.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Ddir::Read => 0,
            Ddir::Write => 1,
            Ddir::Trim => 2,
            _ => panic!("sync direction has no accounting slot"),
        }
    }

    /// True for directions that move data (read/write/trim).
    #[inline]
    pub fn is_data(self) -> bool {
        matches!(self, Ddir::Read | Ddir::Write | Ddir::Trim)
    }

    /// True for flush directions.
    #[inline]
    pub fn is_sync(self) -> bool {
        matches!(self, Ddir::Sync | Ddir::Datasync)
    }

    /// Rate limiter lane: trims pace alongside writes.
    #[inline]
    pub fn rate_lane(self) -> usize {
        match self {
            Ddir::Read => 0,
            _ => 1,
        }
    }
}

impl std::fmt::Display for Ddir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Ddir::Read => "read",
            Ddir::Write => "write",
            Ddir::Trim => "trim",
            Ddir::Sync => "sync",
            Ddir::Datasync => "datasync",
        };
        write!(f, "{}", s)
    }
}

/// One I/O handed to an engine
///
/// `unit` is the pool index of the originating I/O unit and is echoed back in
/// the matching [`IoEvent`].
///
/// # Safety
///
/// `buf` points into the worker's pinned buffer region and must stay valid
/// until the unit completes or is cancelled. Data directions own `len` bytes
/// at `buf`; sync directions ignore `buf`/`len`/`offset`.
#[derive(Debug)]
pub struct SubmittedIo {
    pub ddir: Ddir,
    pub fd: RawFd,
    pub offset: u64,
    pub buf: *mut u8,
    pub len: usize,
    pub unit: usize,
}

// The raw pointer targets the worker-owned buffer region; unit slices are
// exclusive to whichever party holds the unit.
unsafe impl Send for SubmittedIo {}

/// A reaped completion. `result` is bytes transferred, or the errno the
/// operation failed with.
#[derive(Debug, Clone)]
pub struct IoEvent {
    pub unit: usize,
    pub ddir: Ddir,
    pub result: std::result::Result<usize, i32>,
}

/// Outcome of [`IoEngine::queue`]
#[derive(Debug, Clone)]
pub enum QueueResult {
    /// Accepted; will surface via `getevents`/`event` after `commit`.
    Queued,
    /// Synchronous completion, no reap needed.
    Completed(std::result::Result<usize, i32>),
    /// Queue full; the caller must commit + reap and retry the unit.
    Busy,
}

/// Engine capability bits the worker adapts to
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineFlags {
    /// `queue` always returns `Completed`; depth control is moot.
    pub sync_io: bool,
    /// Queued units reach the kernel only on `commit`.
    pub needs_commit: bool,
}

/// The contract every I/O backend implements
pub trait IoEngine: Send {
    fn name(&self) -> &'static str;

    fn flags(&self) -> EngineFlags;

    /// Called once per worker before any I/O, with the configured depth.
    fn init(&mut self, iodepth: usize) -> Result<()>;

    /// Engine-specific preflight for one unit (e.g. arming async handles).
    fn prep(&mut self, _io: &SubmittedIo) -> Result<()> {
        Ok(())
    }

    /// Hand one unit to the engine.
    fn queue(&mut self, io: SubmittedIo) -> Result<QueueResult>;

    /// Flush units accepted as `Queued` since the last commit.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Reap between `min` and `max` completions, waiting up to `timeout`
    /// when fewer than `min` are ready. Returns the number reaped.
    fn getevents(&mut self, min: usize, max: usize, timeout: Option<Duration>) -> Result<usize>;

    /// The i-th completion from the last `getevents` call.
    fn event(&mut self, idx: usize) -> IoEvent;

    /// Best-effort cancel of an in-flight unit.
    fn cancel(&mut self, _unit: usize) -> Result<()> {
        Ok(())
    }

    /// Release engine resources. The engine is unusable afterwards.
    fn cleanup(&mut self) {}
}

/// Look up an engine by its configured name.
pub fn create(name: &str) -> Result<Box<dyn IoEngine>> {
    match name {
        "sync" | "psync" => Ok(Box::new(sync::SyncEngine::new())),
        "mock" => Ok(Box::new(mock::MockEngine::new())),
        other => bail!("unknown io engine '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddir_index() {
        assert_eq!(Ddir::Read.index(), 0);
        assert_eq!(Ddir::Write.index(), 1);
        assert_eq!(Ddir::Trim.index(), 2);
    }

    #[test]
    fn test_ddir_classes() {
        assert!(Ddir::Read.is_data());
        assert!(Ddir::Trim.is_data());
        assert!(!Ddir::Sync.is_data());
        assert!(Ddir::Datasync.is_sync());
    }

    #[test]
    fn test_trim_paces_with_writes() {
        assert_eq!(Ddir::Trim.rate_lane(), Ddir::Write.rate_lane());
        assert_ne!(Ddir::Read.rate_lane(), Ddir::Write.rate_lane());
    }

    #[test]
    fn test_create_by_name() {
        assert!(create("sync").is_ok());
        assert!(create("psync").is_ok());
        assert!(create("mock").is_ok());
        assert!(create("nope").is_err());
    }
}
