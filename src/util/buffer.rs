//! Pinned I/O buffer region
//!
//! One contiguous allocation per worker, sized `iodepth × max_bs` and
//! rounded to the configured alignment, carved into per-unit slices. The
//! allocation strategy (heap, shared-memory segment, anonymous mapping, huge
//! pages) is chosen at init and opaque to everything downstream; O_DIRECT
//! engines only care that slices honor `mem_align`.
//!
//! Unit slices are handed out through unsafe accessors: a slice belongs
//! exclusively to whichever party currently holds the unit (worker while
//! building/submitting, engine while in flight, verifier while checking),
//! so aliasing never occurs in a correct pool discipline.

use crate::Result;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use tracing::warn;

/// Buffer allocation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MemType {
    #[default]
    Heap,
    Shm,
    ShmHuge,
    Mmap,
    MmapHuge,
}

enum Backing {
    Heap { layout: Layout },
    Mmap { len: usize },
    Shm,
}

/// The per-worker pinned buffer pool
pub struct BufferRegion {
    ptr: *mut u8,
    len: usize,
    nr_units: usize,
    stride: usize,
    backing: Backing,
}

// The region is carved into disjoint unit slices; exclusivity per slice is
// enforced by the I/O unit pool, not the type system.
unsafe impl Send for BufferRegion {}
unsafe impl Sync for BufferRegion {}

impl BufferRegion {
    /// Allocate `nr_units` slices of `unit_size` bytes, each aligned to
    /// `mem_align`. Huge-page strategies fall back to their plain variant
    /// with a warning when the system has no huge pages to give.
    pub fn new(nr_units: usize, unit_size: usize, mem_align: usize, mem: MemType) -> Result<Self> {
        if nr_units == 0 || unit_size == 0 {
            bail!("buffer region needs at least one unit of non-zero size");
        }
        let align = mem_align.max(1).next_power_of_two();
        let stride = (unit_size + align - 1) / align * align;
        let len = stride * nr_units;

        let (ptr, backing) = match mem {
            MemType::Heap => {
                let layout = Layout::from_size_align(len, align)
                    .context("invalid buffer layout")?;
                // SAFETY: layout is non-zero and valid.
                let ptr = unsafe { alloc_zeroed(layout) };
                if ptr.is_null() {
                    bail!("failed to allocate {} byte buffer region", len);
                }
                (ptr, Backing::Heap { layout })
            }
            MemType::Mmap | MemType::MmapHuge => {
                let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
                #[cfg(target_os = "linux")]
                if mem == MemType::MmapHuge {
                    flags |= libc::MAP_HUGETLB;
                }
                let mut ptr = Self::mmap(len, flags)?;
                if ptr.is_null() && mem == MemType::MmapHuge {
                    warn!("huge page mapping unavailable, falling back to plain mmap");
                    ptr = Self::mmap(len, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS)?;
                }
                if ptr.is_null() {
                    bail!("mmap of {} byte buffer region failed", len);
                }
                (ptr, Backing::Mmap { len })
            }
            MemType::Shm | MemType::ShmHuge => {
                let mut shm_flags = libc::IPC_CREAT | 0o600;
                #[cfg(target_os = "linux")]
                if mem == MemType::ShmHuge {
                    shm_flags |= libc::SHM_HUGETLB;
                }
                let mut id = unsafe { libc::shmget(libc::IPC_PRIVATE, len, shm_flags) };
                if id < 0 && mem == MemType::ShmHuge {
                    warn!("huge page shm segment unavailable, falling back to plain shm");
                    id = unsafe { libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600) };
                }
                if id < 0 {
                    bail!(
                        "shmget of {} bytes failed: {}",
                        len,
                        std::io::Error::last_os_error()
                    );
                }
                let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
                // Mark for removal now; the segment lives until detach.
                unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
                if ptr == usize::MAX as *mut libc::c_void {
                    bail!("shmat failed: {}", std::io::Error::last_os_error());
                }
                (ptr as *mut u8, Backing::Shm)
            }
        };

        Ok(Self {
            ptr,
            len,
            nr_units,
            stride,
            backing,
        })
    }

    fn mmap(len: usize, flags: libc::c_int) -> Result<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Ok(std::ptr::null_mut());
        }
        Ok(ptr as *mut u8)
    }

    pub fn nr_units(&self) -> usize {
        self.nr_units
    }

    /// Capacity of each unit slice
    pub fn unit_size(&self) -> usize {
        self.stride
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn unit_ptr(&self, idx: usize) -> *mut u8 {
        assert!(idx < self.nr_units, "unit index out of range");
        // SAFETY: idx bounds-checked; stride * idx < len.
        unsafe { self.ptr.add(idx * self.stride) }
    }

    /// Borrow a unit's slice for reading.
    ///
    /// # Safety
    ///
    /// The caller must hold the unit `idx` (pool discipline) and `len` must
    /// not exceed `unit_size()`.
    #[inline]
    pub unsafe fn unit(&self, idx: usize, len: usize) -> &[u8] {
        debug_assert!(len <= self.stride);
        std::slice::from_raw_parts(self.unit_ptr(idx), len)
    }

    /// Borrow a unit's slice for writing.
    ///
    /// # Safety
    ///
    /// As for [`Self::unit`]; additionally no other reference to this unit's
    /// slice may be live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn unit_mut(&self, idx: usize, len: usize) -> &mut [u8] {
        debug_assert!(len <= self.stride);
        std::slice::from_raw_parts_mut(self.unit_ptr(idx), len)
    }
}

impl Drop for BufferRegion {
    fn drop(&mut self) {
        match self.backing {
            Backing::Heap { layout } => unsafe { dealloc(self.ptr, layout) },
            Backing::Mmap { len } => unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, len);
            },
            Backing::Shm => unsafe {
                libc::shmdt(self.ptr as *const libc::c_void);
            },
        }
    }
}

impl std::fmt::Debug for BufferRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegion")
            .field("len", &self.len)
            .field("nr_units", &self.nr_units)
            .field("stride", &self.stride)
            .finish()
    }
}

/// Deterministic pseudo-random fill (write payloads, `refill_buffers`)
pub fn fill_random(buf: &mut [u8], seed: u64) {
    let mut state = seed.max(1);
    for chunk in buf.chunks_mut(8) {
        // xorshift64 keeps refills cheap relative to the I/O itself
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let bytes = state.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}

/// Cheap per-I/O perturbation (`scramble_buffers`): stamps the offset and
/// serial into a few words so identical-pattern writes stay dedupe-hostile
/// without a full refill.
pub fn scramble(buf: &mut [u8], offset: u64, serial: u64) {
    if buf.len() >= 8 {
        buf[..8].copy_from_slice(&offset.to_le_bytes());
    }
    if buf.len() >= 16 {
        let pos = 8 + (offset as usize ^ serial as usize) % (buf.len() - 15);
        buf[pos..pos + 8].copy_from_slice(&serial.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_region_alignment() {
        let region = BufferRegion::new(8, 4096, 4096, MemType::Heap).unwrap();
        for i in 0..8 {
            assert_eq!(region.unit_ptr(i) as usize % 4096, 0);
        }
        assert_eq!(region.unit_size(), 4096);
        assert_eq!(region.len(), 8 * 4096);
    }

    #[test]
    fn test_unit_size_rounds_to_alignment() {
        let region = BufferRegion::new(2, 5000, 4096, MemType::Heap).unwrap();
        assert_eq!(region.unit_size(), 8192);
    }

    #[test]
    fn test_slices_are_disjoint() {
        let region = BufferRegion::new(4, 512, 512, MemType::Heap).unwrap();
        unsafe {
            region.unit_mut(0, 512).fill(0xaa);
            region.unit_mut(1, 512).fill(0xbb);
            assert!(region.unit(0, 512).iter().all(|&b| b == 0xaa));
            assert!(region.unit(1, 512).iter().all(|&b| b == 0xbb));
        }
    }

    #[test]
    fn test_mmap_region_works() {
        let region = BufferRegion::new(4, 4096, 4096, MemType::Mmap).unwrap();
        unsafe {
            region.unit_mut(3, 4096).fill(0x7f);
            assert!(region.unit(3, 4096).iter().all(|&b| b == 0x7f));
        }
    }

    #[test]
    fn test_shm_region_works() {
        let region = BufferRegion::new(2, 4096, 4096, MemType::Shm).unwrap();
        unsafe {
            region.unit_mut(0, 4096).fill(0x42);
            assert!(region.unit(0, 4096).iter().all(|&b| b == 0x42));
        }
    }

    #[test]
    fn test_fill_random_is_deterministic() {
        let mut a = vec![0u8; 4096];
        let mut b = vec![0u8; 4096];
        fill_random(&mut a, 1234);
        fill_random(&mut b, 1234);
        assert_eq!(a, b);

        fill_random(&mut b, 1235);
        assert_ne!(a, b);
    }

    #[test]
    fn test_scramble_changes_buffer() {
        let mut a = vec![0u8; 4096];
        let b = a.clone();
        scramble(&mut a, 8192, 3);
        assert_ne!(a, b);
    }
}
