//! Worker execution
//!
//! One worker drives one job: it owns its files, PRNG streams, I/O unit
//! pool, engine instance and statistics, and walks the run state machine
//! `Created → Initialized → [Ramp] → Running ⇄ Verifying ⇄ Fsyncing →
//! Exited`. The supervisor only flips the shared terminate flag and reaps
//! the report at the end; everything else is worker-private.
//!
//! The main loop builds one I/O per iteration (direction, file, size,
//! offset), pushes it through the engine with batch commit/reap policies,
//! and folds completions into stats, rate pacing, and verify bookkeeping.

pub mod affinity;

use crate::config::Options;
use crate::engine::{self, Ddir, IoEngine, IoEvent, QueueResult, SubmittedIo};
use crate::error::JobError;
use crate::gen::bs::BlockSizer;
use crate::gen::ddir::DirChooser;
use crate::gen::offset::OffsetGen;
use crate::pool::IoUnitPool;
use crate::rate::RateLimiter;
use crate::rng::{RandStreams, RandUse};
use crate::stats::log::{BwTracker, LogKind, SampleLog};
use crate::stats::JobStats;
use crate::target::service::{FileSelector, FileService};
use crate::target::{OpenOpts, Target};
use crate::util::buffer::{self, BufferRegion};
use crate::util::time::Clock;
use crate::verify::history::{HistoryEntry, WriteHistory};
use crate::verify::{self, VerifyParams, VerifyPool, VerifyTask};
use crate::Result;
use anyhow::Context;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Worker life cycle. Monotonic past `Initialized`; cycling is confined to
/// Running/Verifying/Fsyncing. `Reaped` is set by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum RunState {
    NotCreated,
    Created,
    Initialized,
    Ramp,
    Running,
    Verifying,
    Fsyncing,
    Exited,
    Reaped,
}

/// Final word from a worker to the supervisor
#[derive(Debug)]
pub struct WorkerReport {
    pub id: usize,
    pub state: RunState,
    pub stats: JobStats,
}

/// The slice of supervisor state a worker is allowed to see
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    terminate: Arc<AtomicBool>,
    reports: Sender<WorkerReport>,
}

impl WorkerHandle {
    pub fn new(terminate: Arc<AtomicBool>, reports: Sender<WorkerReport>) -> Self {
        Self { terminate, reports }
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    pub fn report(&self, report: WorkerReport) {
        let _ = self.reports.send(report);
    }
}

/// How long one pool/reap wait may park before the loop re-checks terminate
const WAIT_SLICE: Duration = Duration::from_millis(100);

enum Issue {
    Issued,
    PhaseDone,
}

/// One job execution
pub struct Worker {
    id: usize,
    opts: Arc<Options>,
    handle: WorkerHandle,
    state: RunState,
    stats: JobStats,

    streams: RandStreams,
    files: Vec<Target>,
    selector: FileSelector,
    sizer: BlockSizer,
    offset_gen: OffsetGen,
    chooser: DirChooser,

    pool: Arc<IoUnitPool>,
    region: Arc<BufferRegion>,
    engine: Box<dyn IoEngine>,
    rate: RateLimiter,

    history: WriteHistory,
    verify_params: Arc<VerifyParams>,
    verify_pool: Option<VerifyPool>,
    pending_verify: HashMap<usize, HistoryEntry>,

    clock: Clock,
    epoch: Instant,
    deadline: Option<Instant>,

    lat_log: Option<SampleLog>,
    bw_log: Option<SampleLog>,
    bw_tracker: BwTracker,

    /// Engine submissions queued but not yet committed
    queued: usize,
    write_seq: u64,
    issued_bytes: u64,
    total_io_size: u64,
    since_fsync: u64,
    since_fdatasync: u64,
    since_barrier: u64,
    last_was_sync: bool,
    last_write_file: usize,
    device_full: bool,
    fatal: bool,

    /// Layout serialization across workers (`create_serialize`)
    create_lock: Option<Arc<Mutex<()>>>,
}

impl Worker {
    pub fn new(
        id: usize,
        opts: Arc<Options>,
        handle: WorkerHandle,
        create_lock: Option<Arc<Mutex<()>>>,
    ) -> Result<Self> {
        let streams = RandStreams::fill(
            opts.rand_kind(),
            opts.workload.rand_seed.wrapping_add(id as u64),
            opts.workload.rand_repeatable,
        );

        let sizer = BlockSizer::new(opts.bs_specs(), opts.bs_aligns(), opts.workload.bs_unaligned);
        let offset_gen = OffsetGen::new(opts.access_mode())
            .zoned(opts.workload.zone_size, opts.workload.zone_skip)
            .seq_stride(opts.workload.ddir_seq_nr, opts.workload.ddir_seq_add)
            .soft_map(opts.workload.softrandommap);

        let chooser = match opts.workload.rw.fixed_ddir() {
            Some(d) => DirChooser::new(
                Some(d),
                0,
                opts.workload.rwmixcycle,
                opts.workload.trim_percentage,
            ),
            None => DirChooser::new(
                None,
                opts.workload.rwmix_read,
                opts.workload.rwmixcycle,
                opts.workload.trim_percentage,
            ),
        };

        let pool = Arc::new(IoUnitPool::new(opts.depth.iodepth));
        let region = Arc::new(BufferRegion::new(
            opts.depth.iodepth,
            sizer.max_bs() as usize,
            opts.buffers.mem_align,
            opts.buffers.mem_type,
        )?);

        let engine = engine::create(&opts.ioengine)?;
        let now = Instant::now();
        let rate = RateLimiter::new(opts.rate_opts(), now);

        let history = if opts.workload.overwrite && opts.verify.verify_sort {
            WriteHistory::sorted()
        } else {
            WriteHistory::ordered()
        };

        let verify_params = Arc::new(opts.verify_params());

        let lat_log = opts
            .timing
            .write_lat_log
            .then(|| SampleLog::new(LogKind::Clat));
        let bw_log = opts.timing.write_bw_log.then(|| SampleLog::new(LogKind::Bw));
        let bw_tracker = BwTracker::new(opts.timing.bw_avg_time_ms);
        let clock = Clock::new(
            opts.timing.gtod_reduce || opts.timing.clocksource == crate::config::ClockSource::Coarse,
        );
        let total_io_size = opts.total_io_size();

        Ok(Self {
            id,
            opts,
            handle,
            state: RunState::Created,
            stats: JobStats::new(),
            streams,
            files: Vec::new(),
            selector: FileSelector::new(
                Default::default(),
                1,
            ),
            sizer,
            offset_gen,
            chooser,
            pool,
            region,
            engine,
            rate,
            history,
            verify_params,
            verify_pool: None,
            pending_verify: HashMap::new(),
            clock,
            epoch: now,
            deadline: None,
            lat_log,
            bw_log,
            bw_tracker,
            queued: 0,
            write_seq: 0,
            issued_bytes: 0,
            total_io_size,
            since_fsync: 0,
            since_fdatasync: 0,
            since_barrier: 0,
            last_was_sync: false,
            last_write_file: 0,
            device_full: false,
            fatal: false,
            create_lock,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn set_state(&mut self, state: RunState) {
        debug!(worker = self.id, ?state, "runstate");
        self.state = state;
    }

    /// Run the job to completion and report to the supervisor.
    pub fn run(mut self) {
        if let Err(err) = self.init() {
            warn!(worker = self.id, error = %err, "init failed");
            self.stats
                .errors
                .record(JobError::EngineError(err.to_string()), "init");
            self.finish();
            return;
        }
        self.set_state(RunState::Initialized);

        let result = self.run_job();
        if let Err(err) = result {
            // Errors are recorded at their site; only a slot still empty
            // means this one has not been counted yet.
            if !matches!(err, JobError::Cancelled) && !self.stats.errors.is_set() {
                self.stats.errors.record(err, "run_job");
            }
        }

        self.finish();
    }

    fn open_opts(&self) -> OpenOpts {
        OpenOpts {
            odirect: self.opts.files.odirect,
            sync_io: self.opts.files.sync_io,
            create: true,
            fallocate: self.opts.files.fallocate,
            create_fsync: self.opts.files.create_fsync,
        }
    }

    fn init(&mut self) -> Result<()> {
        if let Some(mask) = self.opts.depth.cpumask {
            affinity::set_cpu_affinity(mask)?;
        }
        if let Some(nice) = self.opts.depth.nice {
            affinity::set_nice(nice)?;
        }

        let open_opts = self.open_opts();

        let map_bs = self.sizer.min_bs().max(1);
        let want_map = self.opts.workload.rw.is_random() && !self.opts.workload.norandommap;

        for i in 0..self.opts.files.nr_files {
            let path = self.opts.file_path(self.id, i);
            let lo = self.opts.files.file_size;
            let hi = self.opts.files.file_size_high.max(lo);
            let mut target = Target::new(path, lo, hi);
            target.decide_size(self.streams.get(RandUse::FileSize), map_bs);
            self.files.push(target);
        }

        if !self.opts.files.create_on_open {
            // Layout runs under the shared lock so concurrent workers do
            // not interleave file creation (`create_serialize`).
            let guard = self
                .create_lock
                .as_ref()
                .map(|l| l.lock().unwrap());
            for target in &mut self.files {
                target.open(open_opts).context("opening target")?;
            }
            drop(guard);
        }

        for target in &mut self.files {
            if want_map {
                target.init_random_map(map_bs);
            }
            if self.opts.files.pre_read && target.is_open() {
                target.pre_read(self.sizer.max_bs())?;
            }
        }

        self.selector = FileSelector::new(
            self.opts.files.file_service_type,
            self.opts.files.file_service_nr,
        );

        self.engine
            .init(self.opts.depth.iodepth)
            .context("engine init")?;

        // Non-verify write payloads are generated once and scrambled per
        // I/O unless a refill or zero policy says otherwise.
        if !self.verify_params.mode.enabled() && !self.opts.buffers.zero_buffers {
            for i in 0..self.pool.capacity() {
                let seed = self.streams.get(RandUse::Buffer).next_u64();
                // SAFETY: no unit is in flight yet.
                unsafe {
                    buffer::fill_random(self.region.unit_mut(i, self.region.unit_size()), seed);
                }
            }
        }

        if self.verify_params.mode.enabled() && self.opts.verify.verify_async > 0 {
            self.verify_pool = Some(VerifyPool::new(
                self.opts.verify.verify_async,
                Arc::clone(&self.verify_params),
                Arc::clone(&self.region),
                Arc::clone(&self.pool),
            ));
        }

        Ok(())
    }

    fn run_job(&mut self) -> std::result::Result<(), JobError> {
        self.epoch = Instant::now();
        self.stats.snapshot_rusage_start();

        // Warm-up: full I/O, then every accumulated number is discarded.
        if self.opts.workload.ramp_time_ms > 0 {
            self.set_state(RunState::Ramp);
            let ramp_end = self.epoch + Duration::from_millis(self.opts.workload.ramp_time_ms);
            self.run_phase(Some(ramp_end))?;
            self.reset_after_ramp();
        }

        let stats_start = Instant::now();
        self.deadline = (self.opts.workload.runtime_ms > 0)
            .then(|| stats_start + Duration::from_millis(self.opts.workload.runtime_ms));

        let mut loops_left = self.opts.workload.loops;
        while loops_left > 0 {
            self.set_state(RunState::Running);
            self.run_phase(self.deadline)?;

            if self.verify_params.mode.enabled() && !self.history.is_empty() {
                self.set_state(RunState::Verifying);
                self.run_verify()?;
            }

            loops_left -= 1;
            if loops_left == 0
                || self.fatal
                || self.device_full
                || self.handle.is_terminating()
                || self.past_deadline()
            {
                break;
            }

            // Next loop replays the same sequences against rewound files.
            self.streams.restart();
            self.rewind_files();
            self.selector.reset();
            self.issued_bytes = 0;
        }

        if self.opts.workload.end_fsync {
            self.set_state(RunState::Fsyncing);
            self.run_end_fsync()?;
        }

        self.stats.runtime = stats_start.elapsed();
        self.stats.snapshot_rusage_end();
        Ok(())
    }

    fn past_deadline(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    fn reset_after_ramp(&mut self) {
        debug!(worker = self.id, "ramp over, resetting stats");
        self.stats.reset();
        self.rewind_files();
        let now = Instant::now();
        self.rate.reset(now);
        self.bw_tracker.reset(now.duration_since(self.epoch).as_millis() as u64);
        if let Some(log) = &mut self.lat_log {
            log.reset();
        }
        if let Some(log) = &mut self.bw_log {
            log.reset();
        }
    }

    fn rewind_files(&mut self) {
        let map_bs = self.sizer.min_bs().max(1);
        for f in &mut self.files {
            f.rewind(map_bs);
        }
        self.issued_bytes = 0;
    }

    /// One I/O-issuing phase, bounded by an optional deadline.
    fn run_phase(&mut self, deadline: Option<Instant>) -> std::result::Result<(), JobError> {
        loop {
            if self.handle.is_terminating() {
                self.cancel_inflight();
                return Err(JobError::Cancelled);
            }
            if self.fatal || self.device_full {
                break;
            }
            if let Some(vp) = &self.verify_pool {
                if vp.fatal_hit() {
                    self.fatal = true;
                    break;
                }
            }
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    break;
                }
            }

            if self.total_io_size > 0 && self.issued_bytes >= self.total_io_size {
                let can_continue = self.opts.workload.time_based
                    && deadline.map_or(false, |dl| Instant::now() < dl);
                if can_continue {
                    self.rewind_files();
                    continue;
                }
                break;
            }

            // Writes may not outrun verification further than the backlog.
            if self.opts.verify.verify_backlog > 0
                && self.verify_params.mode.enabled()
                && self.history.len() >= self.opts.verify.verify_backlog
            {
                let batch = self.opts.verify.verify_batch;
                self.verify_entries(batch)?;
            }

            if self.rate.active() {
                if let Err(err) = self.rate.check_min(Instant::now()) {
                    self.stats.errors.record(err.clone(), "run_phase");
                    self.fatal = true;
                    return Err(err);
                }
            }

            match self.issue_one()? {
                Issue::Issued => {}
                Issue::PhaseDone => {
                    let can_continue = self.opts.workload.time_based
                        && deadline.map_or(false, |dl| Instant::now() < dl)
                        && !self.device_full;
                    if can_continue {
                        self.rewind_files();
                        continue;
                    }
                    break;
                }
            }

            self.stats.record_queue_depth(self.pool.cur_depth());
            self.reap_policy()?;
        }

        self.drain_inflight()?;
        Ok(())
    }

    /// Build and submit the next I/O. `PhaseDone` means the workload has no
    /// further offsets to give.
    fn issue_one(&mut self) -> std::result::Result<Issue, JobError> {
        // Interleaved flushes take precedence over data I/O.
        if !self.last_was_sync {
            let w = &self.opts.workload;
            if w.fsync_blocks > 0 && self.since_fsync >= w.fsync_blocks as u64 {
                self.since_fsync = 0;
                return self.issue_sync(Ddir::Sync);
            }
            if w.fdatasync_blocks > 0 && self.since_fdatasync >= w.fdatasync_blocks as u64 {
                self.since_fdatasync = 0;
                return self.issue_sync(Ddir::Datasync);
            }
            if w.barrier_blocks > 0 && self.since_barrier >= w.barrier_blocks as u64 {
                self.since_barrier = 0;
                return self.issue_sync(Ddir::Sync);
            }
        }

        let (idx, requeued) = match self.alloc_unit()? {
            Some(pair) => pair,
            None => return Ok(Issue::Issued), // reaped instead; loop retries
        };

        if requeued {
            let snap = self.pool.snapshot(idx);
            self.submit_unit(idx, snap.ddir, snap.file, snap.offset, snap.len)?;
            return Ok(Issue::Issued);
        }

        let ddir = {
            let (rwmix, trim) = self.streams.get2(RandUse::RwMix, RandUse::Trim);
            self.chooser.next(rwmix, trim)
        };

        let start_offset = self.opts.workload.offset;
        let mode = self.offset_gen.mode();

        // Pick a file, then a size, then an offset within its span.
        let mut attempts = 0;
        let (file_idx, len, rel_offset) = loop {
            let file_idx = self
                .selector
                .next(self.files.len(), self.streams.get(RandUse::NextFile));
            let span = self.files[file_idx].size().saturating_sub(start_offset);
            let remaining = self.files[file_idx].cursor.remaining(mode, ddir, span);

            let len = self
                .sizer
                .next(ddir, self.streams.get(RandUse::BlockSize), remaining);

            let got = len.and_then(|len| {
                let file = &mut self.files[file_idx];
                self.offset_gen
                    .next(
                        &mut file.cursor,
                        file.random_map.as_mut(),
                        self.streams.get(RandUse::Offset),
                        ddir,
                        len,
                        span,
                    )
                    .map(|off| (len, off))
            });

            match got {
                Some((len, off)) => break (file_idx, len, off),
                None => {
                    // This file is spent. Sequential service moves to the
                    // next file; other policies treat it as phase end.
                    if self.opts.files.file_service_type == FileService::Sequential
                        && self.selector.advance(self.files.len())
                    {
                        attempts += 1;
                        if attempts <= self.files.len() {
                            continue;
                        }
                    }
                    self.pool.release(idx);
                    return Ok(Issue::PhaseDone);
                }
            }
        };

        let offset = start_offset + rel_offset;

        let (seed, seq) = if ddir == Ddir::Write && self.verify_params.mode.enabled() {
            let seed = verify::block_seed(self.streams.get(RandUse::Verify), offset);
            let seq = self.write_seq;
            self.write_seq += 1;
            (seed, seq)
        } else {
            (0, 0)
        };

        self.pool.prepare(idx, ddir, file_idx, offset, len, seed, seq);

        if ddir == Ddir::Write {
            // SAFETY: unit idx is ours until completion.
            let buf = unsafe { self.region.unit_mut(idx, len as usize) };
            if self.verify_params.mode.enabled() {
                verify::fill_block(buf, &self.verify_params, offset, seed, seq);
            } else if self.opts.buffers.zero_buffers {
                buf.fill(0);
            } else if self.opts.buffers.refill_buffers {
                let s = self.streams.get(RandUse::Buffer).next_u64();
                buffer::fill_random(buf, s);
            } else if self.opts.buffers.scramble_buffers {
                buffer::scramble(buf, offset, self.write_seq);
            }
        }

        self.issued_bytes += len;
        self.submit_unit(idx, ddir, file_idx, offset, len)?;
        Ok(Issue::Issued)
    }

    /// Allocate a unit, reaping when the pool is at depth.
    fn alloc_unit(&mut self) -> std::result::Result<Option<(usize, bool)>, JobError> {
        match self.pool.get(WAIT_SLICE) {
            Some(pair) => Ok(Some(pair)),
            None => {
                self.reap(1)?;
                Ok(None)
            }
        }
    }

    fn issue_sync(&mut self, ddir: Ddir) -> std::result::Result<Issue, JobError> {
        let (idx, _) = match self.alloc_unit()? {
            Some(pair) => pair,
            None => return Ok(Issue::Issued),
        };
        let file = self.last_write_file;
        self.pool.prepare(idx, ddir, file, 0, 0, 0, 0);
        self.submit_unit(idx, ddir, file, 0, 0)?;
        Ok(Issue::Issued)
    }

    fn submit_unit(
        &mut self,
        idx: usize,
        ddir: Ddir,
        file_idx: usize,
        offset: u64,
        len: u64,
    ) -> std::result::Result<(), JobError> {
        // `create_on_open` defers file creation to the first access.
        if !self.files[file_idx].is_open() {
            let open_opts = self.open_opts();
            let guard = self.create_lock.as_ref().map(|l| l.lock().unwrap());
            let opened = self.files[file_idx].open(open_opts);
            drop(guard);
            opened.map_err(|e| match e.downcast_ref::<std::io::Error>() {
                Some(io) => JobError::from_io(io, "deferred open"),
                None => JobError::EngineError(e.to_string()),
            })?;
        }

        let fd = self.files[file_idx].fd();
        // A requeued continuation lands past the start of the unit's slice.
        let buf_skip = (offset - self.pool.snapshot(idx).orig_offset) as usize;

        loop {
            let io = SubmittedIo {
                ddir,
                fd,
                offset,
                // SAFETY: buf_skip + len never exceeds the unit's slice.
                buf: unsafe { self.region.unit_ptr(idx).add(buf_skip) },
                len: len as usize,
                unit: idx,
            };
            self.engine
                .prep(&io)
                .map_err(|e| JobError::EngineError(e.to_string()))?;

            let submit_ts = Instant::now();
            let outcome = self
                .engine
                .queue(io)
                .map_err(|e| JobError::EngineError(e.to_string()))?;

            match outcome {
                QueueResult::Completed(result) => {
                    self.pool.mark_submitted(idx, submit_ts);
                    self.stats.record_submit_depth(self.pool.cur_depth());
                    return self.on_event(IoEvent {
                        unit: idx,
                        ddir,
                        result,
                    });
                }
                QueueResult::Queued => {
                    self.pool.mark_submitted(idx, submit_ts);
                    self.stats.record_submit_depth(self.pool.cur_depth());
                    self.queued += 1;
                    let batch = if self.opts.depth.iodepth_batch > 0 {
                        self.opts.depth.iodepth_batch
                    } else {
                        self.opts.depth.iodepth
                    };
                    if self.queued >= batch {
                        self.commit()?;
                    }
                    return Ok(());
                }
                QueueResult::Busy => {
                    self.commit()?;
                    self.reap(1)?;
                }
            }
        }
    }

    fn commit(&mut self) -> std::result::Result<(), JobError> {
        if self.queued > 0 {
            self.engine
                .commit()
                .map_err(|e| JobError::EngineError(e.to_string()))?;
            self.queued = 0;
        }
        Ok(())
    }

    /// Reap at least `min` completions from a non-synchronous engine.
    fn reap(&mut self, min: usize) -> std::result::Result<(), JobError> {
        if self.engine.flags().sync_io {
            return Ok(());
        }
        self.commit()?;

        let inflight = self.pool.busy_len();
        if inflight == 0 {
            return Ok(());
        }
        let min = min.min(inflight);
        let max = self.opts.depth.iodepth;

        let n = self
            .engine
            .getevents(min, max, Some(WAIT_SLICE))
            .map_err(|e| JobError::EngineError(e.to_string()))?;

        if n > 0 {
            self.stats.record_complete_depth(self.pool.cur_depth());
        }
        for i in 0..n {
            let ev = self.engine.event(i);
            self.on_event(ev)?;
        }
        Ok(())
    }

    /// Batch policy: drain to `iodepth_low` once the queue saturates,
    /// otherwise reap opportunistically in completion batches.
    fn reap_policy(&mut self) -> std::result::Result<(), JobError> {
        if self.engine.flags().sync_io {
            return Ok(());
        }
        let depth = self.pool.cur_depth();
        let iodepth = self.opts.depth.iodepth;

        if depth >= iodepth {
            let low = if self.opts.depth.iodepth_low > 0 {
                self.opts.depth.iodepth_low
            } else {
                iodepth
            };
            self.reap(std::cmp::max(1, depth - low.min(depth)))?;
        } else if depth >= self.opts.depth.iodepth_batch_complete.max(1) {
            self.reap(0)?;
        }
        Ok(())
    }

    /// Fold one completion into the pool, stats, verify and rate state.
    fn on_event(&mut self, ev: IoEvent) -> std::result::Result<(), JobError> {
        let now = self.clock.now();
        let snap = self.pool.snapshot(ev.unit);

        let result = match ev.result {
            Err(errno) => {
                if errno == libc::ENOSPC && self.opts.workload.fill_device && ev.ddir == Ddir::Write
                {
                    // The device is full; that is the success condition.
                    self.device_full = true;
                    self.pool.complete(ev.unit, Ok(0));
                    return Ok(());
                }
                self.pool.complete(ev.unit, Err(errno));
                self.pending_verify.remove(&ev.unit);
                let err = JobError::from_errno(errno, "io completion");
                self.stats.errors.record(err.clone(), "on_event");
                if err.is_non_fatal() && self.opts.workload.continue_on_error {
                    return Ok(());
                }
                self.fatal = true;
                return Err(err);
            }
            Ok(bytes) => bytes as u64,
        };

        if ev.ddir.is_sync() {
            self.pool.complete(ev.unit, Ok(0));
            self.last_was_sync = true;
            return Ok(());
        }
        self.last_was_sync = false;

        // Latency accounting
        let timing = &self.opts.timing;
        let clat_us = (!timing.disable_clat && !timing.gtod_reduce)
            .then(|| {
                snap.issue_time
                    .map(|t| now.duration_since(t).as_micros() as u64)
            })
            .flatten();
        let slat_us = (!timing.disable_slat && !self.engine.flags().sync_io)
            .then(|| match (snap.start_time, snap.issue_time) {
                (Some(s), Some(i)) => Some(i.duration_since(s).as_micros() as u64),
                _ => None,
            })
            .flatten();

        self.stats
            .record_io(ev.ddir, result, snap.len, slat_us, clat_us);
        if let (Some(log), Some(c)) = (&mut self.lat_log, clat_us) {
            let ms = now.duration_since(self.epoch).as_millis() as u64;
            log.add(ms, c, ev.ddir, snap.len);
        }
        if !timing.disable_bw {
            let ms = now.duration_since(self.epoch).as_millis() as u64;
            self.bw_tracker.account(
                ev.ddir,
                result,
                ms,
                snap.len,
                &mut self.stats,
                self.bw_log.as_mut(),
            );
        }

        // Short transfer: consume what completed, requeue the rest.
        let short = result < snap.len;
        if short && result > 0 && !self.device_full && ev.ddir != Ddir::Trim {
            self.record_write_side_effects(&snap, result);
            self.pool.advance_and_requeue(ev.unit, result);
            self.rate_pace(ev.ddir, result);
            return Ok(());
        }

        // Verify-phase reads hand their unit to the checkers.
        if let Some(entry) = self.pending_verify.remove(&ev.unit) {
            self.pool.settle(ev.unit, Ok(result));
            if let Some(vp) = &self.verify_pool {
                vp.push(VerifyTask {
                    unit: ev.unit,
                    entry,
                    file_name: self.files[snap.file].path().display().to_string(),
                });
            } else {
                // SAFETY: the unit stays busy until release below.
                let buf = unsafe { self.region.unit(ev.unit, entry.len as usize) };
                let check = verify::check_extent(buf, &entry, &self.verify_params);
                if let Err(failure) = check {
                    if self.verify_params.dump {
                        let mut expected = vec![0u8; entry.block_len as usize];
                        verify::fill_block(
                            &mut expected,
                            &self.verify_params,
                            entry.block_offset,
                            entry.seed,
                            entry.seq,
                        );
                        let _ = verify::dump_buffers(
                            &self.verify_params.dump_dir,
                            &self.files[snap.file].path().display().to_string(),
                            failure.offset,
                            buf,
                            &expected,
                        );
                    }
                    self.pool.release(ev.unit);
                    let err = JobError::VerifyMismatch {
                        file: self.files[snap.file].path().display().to_string(),
                        offset: failure.offset,
                        len: failure.len,
                    };
                    self.stats.errors.record(err.clone(), "on_event");
                    if self.verify_params.fatal {
                        self.fatal = true;
                        return Err(err);
                    }
                } else {
                    self.pool.release(ev.unit);
                }
            }
        } else {
            self.pool.complete(ev.unit, Ok(result));
            self.record_write_side_effects(&snap, result);
        }

        self.rate_pace(ev.ddir, result);
        Ok(())
    }

    fn record_write_side_effects(&mut self, snap: &crate::pool::IoUnit, bytes: u64) {
        if snap.ddir != Ddir::Write || bytes == 0 {
            return;
        }
        self.last_write_file = snap.file;
        self.since_fsync += 1;
        self.since_fdatasync += 1;
        self.since_barrier += 1;

        if self.verify_params.mode.enabled() {
            let mut entry =
                HistoryEntry::new(snap.offset, bytes, snap.verify_seed, snap.seq).for_file(snap.file);
            entry.block_offset = snap.orig_offset;
            entry.block_len = snap.orig_len;
            self.history.record(entry);
        }
    }

    fn rate_pace(&mut self, ddir: Ddir, bytes: u64) {
        if !self.rate.active() || !ddir.is_data() {
            return;
        }
        if let Some(sleep) = self.rate.on_complete(ddir.rate_lane(), bytes, Instant::now()) {
            std::thread::sleep(sleep);
        }
    }

    /// Verify up to `limit` history entries (0 = all of them).
    fn verify_entries(&mut self, limit: usize) -> std::result::Result<(), JobError> {
        let mut left = if limit == 0 { usize::MAX } else { limit };

        while left > 0 && !self.fatal {
            if self.handle.is_terminating() {
                return Err(JobError::Cancelled);
            }
            let entry = match self.history.pop() {
                Some(e) => e,
                None => break,
            };
            left -= 1;

            let (idx, requeued) = loop {
                match self.pool.get(WAIT_SLICE) {
                    Some(pair) => break pair,
                    None => self.reap(1)?,
                }
            };
            if requeued {
                let snap = self.pool.snapshot(idx);
                self.submit_unit(idx, snap.ddir, snap.file, snap.offset, snap.len)?;
                // Entry goes back; it will be retried next round.
                self.history.record(entry);
                continue;
            }

            self.pool
                .prepare(idx, Ddir::Read, entry.file, entry.offset, entry.len, entry.seed, entry.seq);
            self.pending_verify.insert(idx, entry.clone());
            self.submit_unit(idx, Ddir::Read, entry.file, entry.offset, entry.len)?;
            self.reap_policy()?;

            if let Some(vp) = &self.verify_pool {
                if vp.fatal_hit() {
                    self.fatal = true;
                }
            }
        }
        Ok(())
    }

    fn run_verify(&mut self) -> std::result::Result<(), JobError> {
        self.verify_entries(0)?;
        self.drain_inflight()?;
        if let Some(vp) = &self.verify_pool {
            vp.wait_drain(0);
            if vp.fatal_hit() {
                self.fatal = true;
            }
        }
        Ok(())
    }

    fn run_end_fsync(&mut self) -> std::result::Result<(), JobError> {
        for i in 0..self.files.len() {
            if !self.files[i].is_open() {
                continue;
            }
            let (idx, _) = loop {
                match self.pool.get(WAIT_SLICE) {
                    Some(pair) => break pair,
                    None => self.reap(1)?,
                }
            };
            self.pool.prepare(idx, Ddir::Sync, i, 0, 0, 0, 0);
            self.submit_unit(idx, Ddir::Sync, i, 0, 0)?;
        }
        self.drain_inflight()
    }

    fn drain_inflight(&mut self) -> std::result::Result<(), JobError> {
        self.commit()?;
        let mut stalled = 0u32;
        while self.pool.busy_len() > self.pending_verify_in_flight() {
            if self.engine.flags().sync_io {
                break;
            }
            let before = self.pool.busy_len();
            self.reap(1)?;
            if self.pool.busy_len() == before {
                stalled += 1;
                if stalled > 50 {
                    return Err(JobError::EngineError(
                        "engine stopped yielding completions during drain".into(),
                    ));
                }
            } else {
                stalled = 0;
            }
        }
        Ok(())
    }

    /// Units held by the async verifier rather than the engine.
    fn pending_verify_in_flight(&self) -> usize {
        self.verify_pool.as_ref().map_or(0, |vp| vp.backlog())
    }

    fn cancel_inflight(&mut self) {
        // Best effort: ask the engine to abandon whatever is still queued.
        for idx in 0..self.pool.capacity() {
            let _ = self.engine.cancel(idx);
        }
    }

    fn finish(&mut self) {
        // Verify threads drain before the job is declared over.
        if let Some(vp) = self.verify_pool.take() {
            vp.wait_drain(0);
            let verify_errors = vp.shutdown();
            self.stats.errors.merge(&verify_errors);
        }

        self.engine.cleanup();

        for target in &mut self.files {
            if self.opts.files.unlink {
                let _ = target.unlink();
            } else {
                let _ = target.close(self.opts.files.fsync_on_close);
            }
        }

        if let Some(log) = &self.lat_log {
            let prefix = format!("{}_{}", self.opts.timing.log_prefix, self.id);
            if let Err(err) = log.persist(&self.opts.files.directory, &prefix) {
                warn!(worker = self.id, error = %err, "failed to persist latency log");
            }
        }
        if let Some(log) = &self.bw_log {
            let prefix = format!("{}_{}", self.opts.timing.log_prefix, self.id);
            if let Err(err) = log.persist(&self.opts.files.directory, &prefix) {
                warn!(worker = self.id, error = %err, "failed to persist bandwidth log");
            }
        }

        self.set_state(RunState::Exited);
        info!(
            worker = self.id,
            errors = self.stats.errors.count(),
            "worker exited"
        );
        self.handle.report(WorkerReport {
            id: self.id,
            state: self.state,
            stats: std::mem::take(&mut self.stats),
        });
    }
}
