//! Target files and block devices
//!
//! A `Target` is one file (or block device) a worker drives I/O against:
//! its size range, open handle, per-file offset cursor, and the optional
//! random map for no-repeat random phases. Targets live in a per-worker
//! arena and are referred to by index everywhere else.

pub mod service;

use crate::gen::offset::Cursor;
use crate::gen::randmap::RandomMap;
use crate::rng::RandSource;
use crate::Result;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Preallocation strategy applied at create time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FallocateMode {
    /// No preallocation; the file is sized with truncate
    #[default]
    None,
    /// posix_fallocate: blocks allocated and zeroed
    Posix,
    /// fallocate with KEEP_SIZE
    Keep,
}

/// Flags consumed when opening a target
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOpts {
    pub odirect: bool,
    pub sync_io: bool,
    pub create: bool,
    pub fallocate: FallocateMode,
    /// fsync the file right after layout
    pub create_fsync: bool,
}

/// One file or block device in the worker's arena
#[derive(Debug)]
pub struct Target {
    path: PathBuf,
    size_low: u64,
    size_high: u64,
    real_size: u64,
    file: Option<File>,
    is_block: bool,
    /// Offset generator state for this file
    pub cursor: Cursor,
    /// No-repeat random state; absent under `norandommap`
    pub random_map: Option<RandomMap>,
}

impl Target {
    /// A target sized in `[size_low, size_high]`; equal bounds fix the size.
    pub fn new(path: impl Into<PathBuf>, size_low: u64, size_high: u64) -> Self {
        Self {
            path: path.into(),
            size_low,
            size_high: size_high.max(size_low),
            real_size: size_low,
            file: None,
            is_block: false,
            cursor: Cursor::default(),
            random_map: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Draw the file size from its range using the dedicated stream.
    pub fn decide_size(&mut self, rng: &mut RandSource, align: u64) {
        if self.size_high > self.size_low {
            let drawn = rng.next_in(self.size_low, self.size_high);
            let align = align.max(1);
            self.real_size = (drawn / align) * align;
        } else {
            self.real_size = self.size_low;
        }
    }

    pub fn size(&self) -> u64 {
        self.real_size
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
    }

    /// Open (and lay out, if creating) the target.
    pub fn open(&mut self, opts: OpenOpts) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }

        let mut flags = 0;
        if opts.odirect {
            flags |= libc::O_DIRECT;
        }
        if opts.sync_io {
            flags |= libc::O_SYNC;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(opts.create)
            .custom_flags(flags)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        let meta = file
            .metadata()
            .with_context(|| format!("failed to stat {}", self.path.display()))?;
        self.is_block = meta.file_type().is_block_device();

        if self.is_block {
            // Device capacity bounds the addressable range.
            let end = unsafe { libc::lseek(file.as_raw_fd(), 0, libc::SEEK_END) };
            if end < 0 {
                bail!("failed to size block device {}", self.path.display());
            }
            let dev_size = end as u64;
            if self.real_size == 0 || self.real_size > dev_size {
                self.real_size = dev_size;
            }
        } else if meta.len() < self.real_size {
            self.layout(&file, opts)?;
        } else if self.real_size == 0 {
            self.real_size = meta.len();
        }

        debug!(path = %self.path.display(), size = self.real_size, "target opened");
        self.file = Some(file);
        Ok(())
    }

    fn layout(&self, file: &File, opts: OpenOpts) -> Result<()> {
        let fd = file.as_raw_fd();
        match opts.fallocate {
            FallocateMode::None => {
                file.set_len(self.real_size)
                    .with_context(|| format!("failed to size {}", self.path.display()))?;
            }
            FallocateMode::Posix => {
                nix::fcntl::posix_fallocate(fd, 0, self.real_size as libc::off_t)
                    .with_context(|| format!("posix_fallocate on {}", self.path.display()))?;
            }
            FallocateMode::Keep => {
                nix::fcntl::fallocate(
                    fd,
                    nix::fcntl::FallocateFlags::FALLOC_FL_KEEP_SIZE,
                    0,
                    self.real_size as libc::off_t,
                )
                .with_context(|| format!("fallocate on {}", self.path.display()))?;
            }
        }
        if opts.create_fsync {
            file.sync_all()
                .with_context(|| format!("create fsync on {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Touch the whole file once before the run so the first measured I/Os
    /// do not pay cold-cache penalties.
    pub fn pre_read(&mut self, bs: u64) -> Result<()> {
        let fd = self.fd();
        if fd < 0 {
            bail!("pre_read on a closed target");
        }
        let bs = bs.max(4096) as usize;
        let mut buf = vec![0u8; bs];
        let mut offset = 0u64;
        while offset < self.real_size {
            let want = buf.len().min((self.real_size - offset) as usize);
            let ret = unsafe {
                libc::pread(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    want,
                    offset as libc::off_t,
                )
            };
            if ret <= 0 {
                break;
            }
            offset += ret as u64;
        }
        Ok(())
    }

    /// Attach a fresh random map at the given block granularity.
    pub fn init_random_map(&mut self, block_size: u64) {
        self.random_map = Some(RandomMap::new(self.real_size, block_size));
    }

    /// Rewind for another loop: cursor back to zero, random map cleared.
    pub fn rewind(&mut self, map_block_size: u64) {
        self.cursor.reset();
        if self.random_map.is_some() {
            self.random_map = Some(RandomMap::new(self.real_size, map_block_size));
        }
    }

    pub fn fsync(&self) -> Result<()> {
        if let Some(file) = &self.file {
            file.sync_all()
                .with_context(|| format!("fsync on {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn close(&mut self, fsync_on_close: bool) -> Result<()> {
        if let Some(file) = self.file.take() {
            if fsync_on_close {
                file.sync_all()
                    .with_context(|| format!("close fsync on {}", self.path.display()))?;
            }
        }
        Ok(())
    }

    /// Remove the file from disk (regular files only).
    pub fn unlink(&mut self) -> Result<()> {
        self.file = None;
        if !self.is_block && self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("failed to unlink {}", self.path.display()))?;
        }
        Ok(())
    }
}
