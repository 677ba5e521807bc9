//! Synchronous I/O engine
//!
//! Baseline engine using blocking positioned syscalls: pread/pwrite for data,
//! fsync/fdatasync for flushes, and hole punching for trims. Every `queue`
//! call completes the unit before returning, so the effective depth is one
//! regardless of the configured `iodepth`.
//!
//! Partial transfers are retried in-place until the full request is moved or
//! the syscall errors; a read hitting EOF returns the short count.

use super::{Ddir, EngineFlags, IoEngine, IoEvent, QueueResult, SubmittedIo};
use crate::Result;
use std::time::Duration;

/// Blocking pread/pwrite engine
pub struct SyncEngine {
    /// Completion slot for callers that reap via getevents anyway
    last_event: Option<IoEvent>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self { last_event: None }
    }

    fn do_read(fd: i32, buf: *mut u8, len: usize, offset: u64) -> std::result::Result<usize, i32> {
        let mut done = 0usize;
        while done < len {
            // SAFETY: buf points at a unit slice of at least `len` bytes and
            // stays valid for the duration of this blocking call.
            let ret = unsafe {
                libc::pread(
                    fd,
                    buf.add(done) as *mut libc::c_void,
                    len - done,
                    (offset + done as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
                if errno == libc::EINTR {
                    continue;
                }
                return Err(errno);
            }
            if ret == 0 {
                // EOF, report the short transfer
                break;
            }
            done += ret as usize;
        }
        Ok(done)
    }

    fn do_write(fd: i32, buf: *const u8, len: usize, offset: u64) -> std::result::Result<usize, i32> {
        let mut done = 0usize;
        while done < len {
            // SAFETY: as for do_read; the slice is read-only here.
            let ret = unsafe {
                libc::pwrite(
                    fd,
                    buf.add(done) as *const libc::c_void,
                    len - done,
                    (offset + done as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
                if errno == libc::EINTR {
                    continue;
                }
                return Err(errno);
            }
            if ret == 0 {
                break;
            }
            done += ret as usize;
        }
        Ok(done)
    }

    fn do_trim(fd: i32, offset: u64, len: usize) -> std::result::Result<usize, i32> {
        // Hole punching stands in for a device discard on regular files.
        let ret = unsafe {
            libc::fallocate(
                fd,
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        Ok(len)
    }

    fn do_sync(fd: i32, data_only: bool) -> std::result::Result<usize, i32> {
        let ret = unsafe {
            if data_only {
                libc::fdatasync(fd)
            } else {
                libc::fsync(fd)
            }
        };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        Ok(0)
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IoEngine for SyncEngine {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn flags(&self) -> EngineFlags {
        EngineFlags {
            sync_io: true,
            needs_commit: false,
        }
    }

    fn init(&mut self, _iodepth: usize) -> Result<()> {
        Ok(())
    }

    fn queue(&mut self, io: SubmittedIo) -> Result<QueueResult> {
        let result = match io.ddir {
            Ddir::Read => Self::do_read(io.fd, io.buf, io.len, io.offset),
            Ddir::Write => Self::do_write(io.fd, io.buf, io.len, io.offset),
            Ddir::Trim => Self::do_trim(io.fd, io.offset, io.len),
            Ddir::Sync => Self::do_sync(io.fd, false),
            Ddir::Datasync => Self::do_sync(io.fd, true),
        };
        self.last_event = Some(IoEvent {
            unit: io.unit,
            ddir: io.ddir,
            result,
        });
        Ok(QueueResult::Completed(
            self.last_event.as_ref().map(|e| e.result.clone()).unwrap(),
        ))
    }

    fn getevents(&mut self, _min: usize, _max: usize, _timeout: Option<Duration>) -> Result<usize> {
        Ok(if self.last_event.is_some() { 1 } else { 0 })
    }

    fn event(&mut self, _idx: usize) -> IoEvent {
        self.last_event
            .take()
            .expect("sync engine has no reaped event")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_sync_write_then_read() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 8192]).unwrap();
        let fd = tmp.as_file().as_raw_fd();

        let mut engine = SyncEngine::new();
        engine.init(1).unwrap();

        let mut wbuf = vec![0xabu8; 4096];
        let res = engine
            .queue(SubmittedIo {
                ddir: Ddir::Write,
                fd,
                offset: 4096,
                buf: wbuf.as_mut_ptr(),
                len: 4096,
                unit: 0,
            })
            .unwrap();
        match res {
            QueueResult::Completed(Ok(n)) => assert_eq!(n, 4096),
            other => panic!("unexpected queue result: {:?}", other),
        }

        let mut rbuf = vec![0u8; 4096];
        let res = engine
            .queue(SubmittedIo {
                ddir: Ddir::Read,
                fd,
                offset: 4096,
                buf: rbuf.as_mut_ptr(),
                len: 4096,
                unit: 1,
            })
            .unwrap();
        match res {
            QueueResult::Completed(Ok(n)) => assert_eq!(n, 4096),
            other => panic!("unexpected queue result: {:?}", other),
        }
        assert!(rbuf.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn test_sync_read_past_eof_is_short() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1u8; 1024]).unwrap();
        let fd = tmp.as_file().as_raw_fd();

        let mut engine = SyncEngine::new();
        let mut buf = vec![0u8; 4096];
        let res = engine
            .queue(SubmittedIo {
                ddir: Ddir::Read,
                fd,
                offset: 0,
                buf: buf.as_mut_ptr(),
                len: 4096,
                unit: 0,
            })
            .unwrap();
        match res {
            QueueResult::Completed(Ok(n)) => assert_eq!(n, 1024),
            other => panic!("unexpected queue result: {:?}", other),
        }
    }

    #[test]
    fn test_sync_fsync() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let fd = tmp.as_file().as_raw_fd();

        let mut engine = SyncEngine::new();
        let res = engine
            .queue(SubmittedIo {
                ddir: Ddir::Sync,
                fd,
                offset: 0,
                buf: std::ptr::null_mut(),
                len: 0,
                unit: 0,
            })
            .unwrap();
        assert!(matches!(res, QueueResult::Completed(Ok(0))));
    }

    #[test]
    fn test_sync_bad_fd_reports_errno() {
        let mut engine = SyncEngine::new();
        let mut buf = vec![0u8; 512];
        let res = engine
            .queue(SubmittedIo {
                ddir: Ddir::Read,
                fd: -1,
                offset: 0,
                buf: buf.as_mut_ptr(),
                len: 512,
                unit: 0,
            })
            .unwrap();
        match res {
            QueueResult::Completed(Err(errno)) => assert_eq!(errno, libc::EBADF),
            other => panic!("unexpected queue result: {:?}", other),
        }
    }
}
