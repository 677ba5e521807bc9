//! Job error taxonomy
//!
//! Every worker owns a single error slot: the first error wins, later errors
//! only bump the counter. Non-fatal I/O errors (EIO, EILSEQ) are recoverable
//! when `continue_on_error` is set; every other class ends the job.

use std::fmt;
use thiserror::Error;

/// Formatted error context is capped at this many bytes, matching the
/// fixed-size slot the summary printer reserves per worker.
pub const VERROR_SIZE: usize = 128;

/// Error classes a job can end with
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Rejected option set (reported before any worker starts)
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Buffers or file slots could not be obtained
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// An I/O operation failed with the given errno
    #[error("io error: {msg} ({})", errno_name(*.errno))]
    IoFailed { errno: i32, msg: String },

    /// Read-back data did not match what was written
    #[error("verify: bad data in {file} at offset {offset}, length {len}")]
    VerifyMismatch { file: String, offset: u64, len: u64 },

    /// Measured rate fell below the configured minimum over a full window
    #[error("rate below minimum: got {got}/s, wanted at least {min}/s")]
    RateTooLow { got: u64, min: u64 },

    /// Job exceeded its configured runtime
    #[error("job timed out")]
    Timeout,

    /// Terminate flag observed
    #[error("job cancelled")]
    Cancelled,

    /// The I/O engine reported a failure outside a single operation
    #[error("engine: {0}")]
    EngineError(String),
}

impl JobError {
    /// Build an `IoFailed` from a raw OS error.
    pub fn from_errno(errno: i32, what: &str) -> Self {
        JobError::IoFailed {
            errno,
            msg: what.to_string(),
        }
    }

    /// Build an `IoFailed` from `std::io::Error`, preserving the errno.
    pub fn from_io(err: &std::io::Error, what: &str) -> Self {
        JobError::IoFailed {
            errno: err.raw_os_error().unwrap_or(libc::EIO),
            msg: format!("{}: {}", what, err),
        }
    }

    /// Non-fatal errors update counters without changing the run state when
    /// `continue_on_error` is set.
    pub fn is_non_fatal(&self) -> bool {
        matches!(
            self,
            JobError::IoFailed { errno, .. } if *errno == libc::EIO || *errno == libc::EILSEQ
        )
    }

    /// The errno carried by this error, if any (0 otherwise).
    pub fn errno(&self) -> i32 {
        match self {
            JobError::IoFailed { errno, .. } => *errno,
            _ => 0,
        }
    }
}

/// Per-worker error slot: first error wins, the count is monotonic.
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot {
    first: Option<JobError>,
    /// Formatted `{file, line, function, error}` context for the first error
    verror: String,
    count: u64,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error. Only the first populates the slot; every call bumps
    /// the counter. Caller location is captured for the context string.
    #[track_caller]
    pub fn record(&mut self, err: JobError, func: &str) {
        self.count += 1;
        if self.first.is_none() {
            let loc = std::panic::Location::caller();
            let mut msg = format!(
                "file:{}:{}, func={}, error={}",
                loc.file(),
                loc.line(),
                func,
                err
            );
            msg.truncate(VERROR_SIZE);
            self.verror = msg;
            self.first = Some(err);
        }
    }

    pub fn first_error(&self) -> Option<&JobError> {
        self.first.as_ref()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn context(&self) -> &str {
        &self.verror
    }

    pub fn is_set(&self) -> bool {
        self.first.is_some()
    }

    /// Fold another slot into this one (used when aggregating workers).
    pub fn merge(&mut self, other: &ErrorSlot) {
        self.count += other.count;
        if self.first.is_none() {
            self.first = other.first.clone();
            self.verror = other.verror.clone();
        }
    }
}

impl fmt::Display for ErrorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.first {
            Some(_) => write!(f, "{}", self.verror),
            None => write!(f, "no error"),
        }
    }
}

/// Symbolic name for common errno values, falling back to the number.
pub fn errno_name(errno: i32) -> String {
    let name = match errno {
        libc::EIO => "EIO",
        libc::EILSEQ => "EILSEQ",
        libc::ENOSPC => "ENOSPC",
        libc::EINVAL => "EINVAL",
        libc::EAGAIN => "EAGAIN",
        libc::ENOMEM => "ENOMEM",
        libc::EBADF => "EBADF",
        libc::ENOENT => "ENOENT",
        libc::EACCES => "EACCES",
        libc::EINTR => "EINTR",
        _ => return format!("errno {}", errno),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let mut slot = ErrorSlot::new();
        slot.record(JobError::Timeout, "run");
        slot.record(JobError::Cancelled, "run");

        assert_eq!(slot.count(), 2);
        assert!(matches!(slot.first_error(), Some(JobError::Timeout)));
    }

    #[test]
    fn test_context_has_location() {
        let mut slot = ErrorSlot::new();
        slot.record(JobError::from_errno(libc::EIO, "pread"), "do_io");

        let ctx = slot.context();
        assert!(ctx.contains("func=do_io"));
        assert!(ctx.contains("file:"));
        assert!(ctx.len() <= VERROR_SIZE);
    }

    #[test]
    fn test_non_fatal_classification() {
        assert!(JobError::from_errno(libc::EIO, "x").is_non_fatal());
        assert!(JobError::from_errno(libc::EILSEQ, "x").is_non_fatal());
        assert!(!JobError::from_errno(libc::ENOSPC, "x").is_non_fatal());
        assert!(!JobError::Timeout.is_non_fatal());
        assert!(!JobError::VerifyMismatch {
            file: "f".into(),
            offset: 0,
            len: 4096
        }
        .is_non_fatal());
    }

    #[test]
    fn test_merge_preserves_first() {
        let mut a = ErrorSlot::new();
        let mut b = ErrorSlot::new();
        b.record(JobError::Timeout, "run");

        a.merge(&b);
        assert_eq!(a.count(), 1);
        assert!(a.is_set());
    }
}
