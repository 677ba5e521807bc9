//! Data verification
//!
//! Write payloads are generated either from a fixed byte pattern or from a
//! per-block seeded stream; each verify interval carries a 32-byte header
//! (magic, length, offset, block seed, sequence number, payload CRC32).
//! Reads of previously written extents are checked against regenerated
//! content: header-only CRC for the cheap mode, full payload compare for
//! pattern mode, header CRC plus sequence numbers for meta mode.
//!
//! Checking runs inline in the worker loop, or offloaded to a small pool of
//! verifier threads sharing the I/O unit pool; `verify_backlog` bounds how
//! far writes may outrun verification.

pub mod history;

use crate::error::{ErrorSlot, JobError};
use crate::pool::IoUnitPool;
use crate::rng::RandSource;
use crate::util::buffer::{self, BufferRegion};
use crate::Result;
use anyhow::Context;
use history::HistoryEntry;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Bytes of header stamped into each verify interval
pub const HEADER_SIZE: usize = 32;

/// Largest accepted fixed verify pattern
pub const MAX_PATTERN_SIZE: usize = 512;

const HEADER_MAGIC: u32 = 0x696f_6d6c;

/// Verification mode, from the `verify` option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMode {
    #[default]
    Off,
    /// Header-only CRC check
    Crc32,
    /// Header check plus full payload compare
    Pattern,
    /// Header CRC plus sequence numbers
    Meta,
}

impl VerifyMode {
    pub fn enabled(self) -> bool {
        self != VerifyMode::Off
    }
}

/// Everything the checkers need to regenerate and judge a block
#[derive(Debug, Clone)]
pub struct VerifyParams {
    pub mode: VerifyMode,
    /// Fixed pattern bytes; empty selects seeded payloads
    pub pattern: Vec<u8>,
    /// Verify interval; 0 treats the whole block as one interval
    pub interval: u64,
    /// Header position within each interval
    pub header_offset: u64,
    /// A mismatch ends the job instead of counting
    pub fatal: bool,
    /// Persist offending buffers next to the job files
    pub dump: bool,
    pub dump_dir: PathBuf,
}

impl Default for VerifyParams {
    fn default() -> Self {
        Self {
            mode: VerifyMode::Off,
            pattern: Vec::new(),
            interval: 0,
            header_offset: 0,
            fatal: false,
            dump: false,
            dump_dir: PathBuf::from("."),
        }
    }
}

/// One observed mismatch
#[derive(Debug, Clone)]
pub struct VerifyFailure {
    pub offset: u64,
    pub len: u64,
    pub what: &'static str,
}

/// Seed for the payload of a block written at `offset`.
///
/// Draws from the dedicated verify stream and folds the offset in, so
/// distinct blocks written in the same tick still differ.
pub fn block_seed(verify_rng: &mut RandSource, offset: u64) -> u64 {
    let draw = verify_rng.next_u64();
    let mut z = draw ^ offset.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z ^ (z >> 31)
}

fn interval_len(params: &VerifyParams, block_len: u64) -> u64 {
    if params.interval == 0 || params.interval > block_len {
        block_len
    } else {
        params.interval
    }
}

fn write_header(chunk: &mut [u8], hdr_off: usize, offset: u64, seed: u64, seq: u64) {
    let len = chunk.len() as u32;
    // CRC covers the payload with the header range zeroed out.
    chunk[hdr_off..hdr_off + HEADER_SIZE].fill(0);
    let crc = crc32fast::hash(chunk);

    let h = &mut chunk[hdr_off..hdr_off + HEADER_SIZE];
    h[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
    h[4..8].copy_from_slice(&len.to_le_bytes());
    h[8..16].copy_from_slice(&offset.to_le_bytes());
    h[16..24].copy_from_slice(&seed.to_le_bytes());
    h[24..28].copy_from_slice(&(seq as u32).to_le_bytes());
    h[28..32].copy_from_slice(&crc.to_le_bytes());
}

struct Header {
    magic: u32,
    len: u32,
    offset: u64,
    seed: u64,
    seq: u32,
    crc: u32,
}

fn read_header(chunk: &[u8], hdr_off: usize) -> Header {
    let h = &chunk[hdr_off..hdr_off + HEADER_SIZE];
    Header {
        magic: u32::from_le_bytes(h[0..4].try_into().unwrap()),
        len: u32::from_le_bytes(h[4..8].try_into().unwrap()),
        offset: u64::from_le_bytes(h[8..16].try_into().unwrap()),
        seed: u64::from_le_bytes(h[16..24].try_into().unwrap()),
        seq: u32::from_le_bytes(h[24..28].try_into().unwrap()),
        crc: u32::from_le_bytes(h[28..32].try_into().unwrap()),
    }
}

/// Fill a write buffer: payload first, then one header per interval.
pub fn fill_block(buf: &mut [u8], params: &VerifyParams, offset: u64, seed: u64, seq: u64) {
    if params.pattern.is_empty() {
        buffer::fill_random(buf, seed);
    } else {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = params.pattern[i % params.pattern.len()];
        }
    }

    if !params.mode.enabled() {
        return;
    }

    let ival = interval_len(params, buf.len() as u64) as usize;
    let hdr_off = (params.header_offset as usize).min(ival.saturating_sub(HEADER_SIZE));
    let mut chunk_start = 0usize;
    while chunk_start + HEADER_SIZE <= buf.len() {
        let chunk_len = ival.min(buf.len() - chunk_start);
        if chunk_len < HEADER_SIZE {
            break;
        }
        let chunk = &mut buf[chunk_start..chunk_start + chunk_len];
        let hdr = hdr_off.min(chunk_len - HEADER_SIZE);
        write_header(chunk, hdr, offset + chunk_start as u64, seed, seq);
        chunk_start += chunk_len;
    }
}

fn check_chunk(
    chunk: &[u8],
    params: &VerifyParams,
    expect_offset: u64,
    expect_seed: u64,
    expect_seq: u64,
) -> std::result::Result<(), VerifyFailure> {
    let ival = chunk.len();
    let hdr_off = (params.header_offset as usize).min(ival - HEADER_SIZE);
    let h = read_header(chunk, hdr_off);

    let fail = |what: &'static str| VerifyFailure {
        offset: expect_offset,
        len: chunk.len() as u64,
        what,
    };

    if h.magic != HEADER_MAGIC {
        return Err(fail("bad header magic"));
    }
    if h.len as usize != chunk.len() || h.offset != expect_offset {
        return Err(fail("header describes a different block"));
    }
    if h.seed != expect_seed {
        return Err(fail("stale data (wrong block seed)"));
    }
    if params.mode == VerifyMode::Meta && h.seq as u64 != (expect_seq & 0xffff_ffff) {
        return Err(fail("stale data (wrong sequence number)"));
    }

    // CRC over the payload with the header range zeroed.
    let mut scratch = chunk.to_vec();
    scratch[hdr_off..hdr_off + HEADER_SIZE].fill(0);
    if crc32fast::hash(&scratch) != h.crc {
        return Err(fail("payload crc mismatch"));
    }

    Ok(())
}

/// Check a read-back buffer against a history entry.
///
/// Full original blocks go through the mode-specific header checks. A
/// trimmed extent (a partial survivor of an overlapping overwrite) no
/// longer holds aligned headers, so it is compared byte-for-byte against
/// the regenerated original instead.
pub fn check_extent(
    buf: &[u8],
    entry: &HistoryEntry,
    params: &VerifyParams,
) -> std::result::Result<(), VerifyFailure> {
    let full_block = entry.offset == entry.block_offset && entry.len == entry.block_len;

    if full_block && buf.len() >= HEADER_SIZE {
        let ival = interval_len(params, buf.len() as u64) as usize;
        let mut chunk_start = 0usize;
        while chunk_start + HEADER_SIZE <= buf.len() {
            let chunk_len = ival.min(buf.len() - chunk_start);
            if chunk_len < HEADER_SIZE {
                break;
            }
            check_chunk(
                &buf[chunk_start..chunk_start + chunk_len],
                params,
                entry.offset + chunk_start as u64,
                entry.seed,
                entry.seq,
            )?;
            chunk_start += chunk_len;
        }

        // Full payload compare regenerates the block in one piece; seeded
        // payloads span intervals, so chunk-local regeneration would lie.
        if params.mode == VerifyMode::Pattern {
            let mut expected = vec![0u8; buf.len()];
            fill_block(&mut expected, params, entry.offset, entry.seed, entry.seq);
            if expected != buf {
                let bad = expected
                    .iter()
                    .zip(buf.iter())
                    .position(|(a, b)| a != b)
                    .unwrap_or(0) as u64;
                let ival = interval_len(params, buf.len() as u64);
                return Err(VerifyFailure {
                    offset: entry.offset + (bad / ival) * ival,
                    len: entry.len,
                    what: "payload differs from written pattern",
                });
            }
        }
        return Ok(());
    }

    // Regenerate the original block and compare the surviving extent.
    let mut original = vec![0u8; entry.block_len as usize];
    fill_block(
        &mut original,
        params,
        entry.block_offset,
        entry.seed,
        entry.seq,
    );
    let skip = (entry.offset - entry.block_offset) as usize;
    let expected = &original[skip..skip + entry.len as usize];
    if buf != expected {
        return Err(VerifyFailure {
            offset: entry.offset,
            len: entry.len,
            what: "extent differs from written data",
        });
    }
    Ok(())
}

/// Persist the offending buffers of a mismatch for offline inspection.
pub fn dump_buffers(
    dir: &std::path::Path,
    name: &str,
    offset: u64,
    received: &[u8],
    expected: &[u8],
) -> Result<()> {
    let base = dir.join(format!("{}.{}", name, offset));
    std::fs::write(base.with_extension("received"), received)
        .context("failed to dump received buffer")?;
    std::fs::write(base.with_extension("expected"), expected)
        .context("failed to dump expected buffer")?;
    Ok(())
}

/// Work handed to the verifier threads
#[derive(Debug)]
pub struct VerifyTask {
    /// Pool unit holding the read-back data; released when checked
    pub unit: usize,
    pub entry: HistoryEntry,
    pub file_name: String,
}

struct VerifyShared {
    queue: Mutex<VecDeque<VerifyTask>>,
    work_cond: Condvar,
    done_cond: Condvar,
    exit: AtomicBool,
    pending: AtomicUsize,
    fatal_hit: AtomicBool,
    errors: Mutex<ErrorSlot>,
}

/// Asynchronous verify offload: `nr_verify_threads` checkers sharing the
/// worker's unit pool and buffer region
pub struct VerifyPool {
    shared: Arc<VerifyShared>,
    threads: Vec<JoinHandle<()>>,
}

impl VerifyPool {
    pub fn new(
        nr_threads: usize,
        params: Arc<VerifyParams>,
        region: Arc<BufferRegion>,
        units: Arc<IoUnitPool>,
    ) -> Self {
        let shared = Arc::new(VerifyShared {
            queue: Mutex::new(VecDeque::new()),
            work_cond: Condvar::new(),
            done_cond: Condvar::new(),
            exit: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            fatal_hit: AtomicBool::new(false),
            errors: Mutex::new(ErrorSlot::new()),
        });

        let threads = (0..nr_threads.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                let params = Arc::clone(&params);
                let region = Arc::clone(&region);
                let units = Arc::clone(&units);
                std::thread::Builder::new()
                    .name(format!("verify{}", i))
                    .spawn(move || Self::run(shared, params, region, units))
                    .expect("failed to spawn verify thread")
            })
            .collect();

        Self { shared, threads }
    }

    fn run(
        shared: Arc<VerifyShared>,
        params: Arc<VerifyParams>,
        region: Arc<BufferRegion>,
        units: Arc<IoUnitPool>,
    ) {
        loop {
            let task = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    if let Some(task) = queue.pop_front() {
                        break task;
                    }
                    if shared.exit.load(Ordering::Acquire) {
                        return;
                    }
                    queue = shared.work_cond.wait(queue).unwrap();
                }
            };

            // SAFETY: the unit stays busy until release below, so its slice
            // is exclusively ours.
            let buf = unsafe { region.unit(task.unit, task.entry.len as usize) };
            let result = check_extent(buf, &task.entry, &params);

            if let Err(failure) = result {
                error!(
                    file = %task.file_name,
                    offset = failure.offset,
                    what = failure.what,
                    "verify mismatch"
                );
                if params.dump {
                    let mut expected = vec![0u8; task.entry.block_len as usize];
                    fill_block(
                        &mut expected,
                        &params,
                        task.entry.block_offset,
                        task.entry.seed,
                        task.entry.seq,
                    );
                    let _ = dump_buffers(
                        &params.dump_dir,
                        &task.file_name,
                        failure.offset,
                        buf,
                        &expected,
                    );
                }
                shared.errors.lock().unwrap().record(
                    JobError::VerifyMismatch {
                        file: task.file_name.clone(),
                        offset: failure.offset,
                        len: failure.len,
                    },
                    "verify_thread",
                );
                if params.fatal {
                    shared.fatal_hit.store(true, Ordering::Release);
                }
            } else {
                debug!(offset = task.entry.offset, "verified");
            }

            units.release(task.unit);
            // Decrement under the queue lock so wait_drain cannot miss the
            // wakeup between its predicate check and the wait.
            let guard = shared.queue.lock().unwrap();
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            drop(guard);
            shared.done_cond.notify_all();
        }
    }

    /// Queue one extent for checking.
    pub fn push(&self, task: VerifyTask) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(task);
        drop(queue);
        self.shared.work_cond.notify_one();
    }

    /// Extents queued or being checked right now.
    pub fn backlog(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// A fatal mismatch was observed; the worker should stop submitting.
    pub fn fatal_hit(&self) -> bool {
        self.shared.fatal_hit.load(Ordering::Acquire)
    }

    /// Block until the backlog drains to at most `target`.
    pub fn wait_drain(&self, target: usize) {
        let mut queue = self.shared.queue.lock().unwrap();
        while self.shared.pending.load(Ordering::Acquire) > target {
            queue = self.shared.done_cond.wait(queue).unwrap();
        }
        drop(queue);
    }

    /// Stop the checkers, wait for them, and hand back the error slot.
    pub fn shutdown(self) -> ErrorSlot {
        self.shared.exit.store(true, Ordering::Release);
        self.shared.work_cond.notify_all();
        for t in self.threads {
            let _ = t.join();
        }
        self.shared.errors.lock().unwrap().clone()
    }
}
