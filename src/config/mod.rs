//! Job options
//!
//! The full option set a job consumes, deserialized from a TOML job file
//! with CLI overrides on top. Groups mirror the concerns of the runtime:
//! workload shape, files, queue depth, rate, verification, buffers, timing
//! and error policy. Derived helpers translate raw options into the
//! generator/limiter/engine inputs the worker wants.

pub mod cli;
pub mod validator;

use crate::engine::{Ddir, DDIR_COUNT};
use crate::gen::bs::{BsSpec, SplitEntry};
use crate::gen::offset::{AccessMode, SeqMode};
use crate::rate::RateOpts;
use crate::rng::RandKind;
use crate::stats::DEFAULT_PERCENTILES;
use crate::target::service::FileService;
use crate::target::FallocateMode;
use crate::util::buffer::MemType;
use crate::verify::{VerifyMode, VerifyParams};
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Workload direction, the `rw` option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RwKind {
    #[default]
    Read,
    Write,
    Trim,
    RandRead,
    RandWrite,
    RandTrim,
    #[serde(alias = "readwrite")]
    Rw,
    RandRw,
}

impl RwKind {
    pub fn is_random(self) -> bool {
        matches!(
            self,
            RwKind::RandRead | RwKind::RandWrite | RwKind::RandTrim | RwKind::RandRw
        )
    }

    pub fn is_mixed(self) -> bool {
        matches!(self, RwKind::Rw | RwKind::RandRw)
    }

    /// The single direction of a pure workload
    pub fn fixed_ddir(self) -> Option<Ddir> {
        match self {
            RwKind::Read | RwKind::RandRead => Some(Ddir::Read),
            RwKind::Write | RwKind::RandWrite => Some(Ddir::Write),
            RwKind::Trim | RwKind::RandTrim => Some(Ddir::Trim),
            _ => None,
        }
    }

    pub fn writes(self) -> bool {
        matches!(
            self,
            RwKind::Write | RwKind::RandWrite | RwKind::Rw | RwKind::RandRw
        )
    }

    pub fn reads(self) -> bool {
        matches!(
            self,
            RwKind::Read | RwKind::RandRead | RwKind::Rw | RwKind::RandRw
        )
    }
}

/// Block-size specification for one direction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BsConfig {
    pub min: u64,
    pub max: u64,
    /// Weighted discrete sizes; overrides the range when non-empty
    pub split: Vec<SplitConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitConfig {
    pub bs: u64,
    pub perc: u32,
}

impl Default for BsConfig {
    fn default() -> Self {
        Self {
            min: 4096,
            max: 4096,
            split: Vec::new(),
        }
    }
}

impl BsConfig {
    pub fn fixed(bs: u64) -> Self {
        Self {
            min: bs,
            max: bs,
            split: Vec::new(),
        }
    }

    fn to_spec(&self) -> BsSpec {
        if self.split.is_empty() {
            BsSpec::Range {
                min: self.min,
                max: self.max,
            }
        } else {
            BsSpec::Split(
                self.split
                    .iter()
                    .map(|s| SplitEntry {
                        bs: s.bs,
                        perc: s.perc,
                    })
                    .collect(),
            )
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadOpts {
    pub rw: RwKind,
    /// Tie read/write sequential cursors together
    pub rw_seq_identical: bool,
    /// Bytes of I/O per file; 0 means the whole file
    pub size: u64,
    /// Starting offset within each file
    pub offset: u64,
    /// Block sizes; `bs` covers every direction unless overridden
    pub bs: BsConfig,
    pub bs_write: Option<BsConfig>,
    pub bs_trim: Option<BsConfig>,
    /// Alignment per direction; 0 aligns to that direction's min bs
    pub ba: u64,
    pub bs_unaligned: bool,
    pub zone_size: u64,
    pub zone_skip: u64,
    /// Sequential I/Os issued per random draw
    pub ddir_seq_nr: u32,
    /// Extra stride per sequential advance
    pub ddir_seq_add: u64,
    /// Read percentage of a mixed workload
    pub rwmix_read: u32,
    /// Issues between mix re-evaluations
    pub rwmixcycle: u32,
    /// Percentage of I/Os issued as trims
    pub trim_percentage: u32,
    pub loops: u32,
    pub time_based: bool,
    /// Run time in milliseconds; 0 means until size is done
    pub runtime_ms: u64,
    /// Warm-up whose samples are discarded
    pub ramp_time_ms: u64,
    pub norandommap: bool,
    pub softrandommap: bool,
    pub rand_repeatable: bool,
    pub use_os_rand: bool,
    pub rand_seed: u64,
    /// Stop when the device/file refuses further writes
    pub fill_device: bool,
    /// Writes may land on already-written offsets; sorts verify history
    pub overwrite: bool,
    pub fsync_blocks: u32,
    pub fdatasync_blocks: u32,
    pub barrier_blocks: u32,
    pub end_fsync: bool,
    pub continue_on_error: bool,
}

impl Default for WorkloadOpts {
    fn default() -> Self {
        Self {
            rw: RwKind::Read,
            rw_seq_identical: false,
            size: 0,
            offset: 0,
            bs: BsConfig::default(),
            bs_write: None,
            bs_trim: None,
            ba: 0,
            bs_unaligned: false,
            zone_size: 0,
            zone_skip: 0,
            ddir_seq_nr: 1,
            ddir_seq_add: 0,
            rwmix_read: 50,
            rwmixcycle: 1,
            trim_percentage: 0,
            loops: 1,
            time_based: false,
            runtime_ms: 0,
            ramp_time_ms: 0,
            norandommap: false,
            softrandommap: false,
            rand_repeatable: true,
            use_os_rand: false,
            rand_seed: 0x6d69_6c6c,
            fill_device: false,
            overwrite: false,
            fsync_blocks: 0,
            fdatasync_blocks: 0,
            barrier_blocks: 0,
            end_fsync: false,
            continue_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOpts {
    pub directory: PathBuf,
    /// Explicit file name; jobs otherwise derive `<name>.<job>.<file>`
    pub filename: Option<PathBuf>,
    pub nr_files: usize,
    /// File size, or the low end of a size range
    pub file_size: u64,
    /// High end of the size range; 0 fixes the size at `file_size`
    pub file_size_high: u64,
    pub file_service_type: FileService,
    pub file_service_nr: u32,
    pub create_serialize: bool,
    pub create_fsync: bool,
    pub create_on_open: bool,
    pub pre_read: bool,
    pub unlink: bool,
    pub fallocate: FallocateMode,
    pub fsync_on_close: bool,
    pub odirect: bool,
    pub sync_io: bool,
}

impl Default for FileOpts {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            filename: None,
            nr_files: 1,
            file_size: 0,
            file_size_high: 0,
            file_service_type: FileService::RoundRobin,
            file_service_nr: 1,
            create_serialize: true,
            create_fsync: false,
            create_on_open: false,
            pre_read: false,
            unlink: false,
            fallocate: FallocateMode::None,
            fsync_on_close: false,
            odirect: false,
            sync_io: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthOpts {
    pub iodepth: usize,
    /// Drain the queue to this depth once it fills; 0 tracks `iodepth`
    pub iodepth_low: usize,
    /// Submissions accumulated before an engine commit; 0 tracks `iodepth`
    pub iodepth_batch: usize,
    /// Completions reaped per getevents call
    pub iodepth_batch_complete: usize,
    pub numjobs: usize,
    pub use_thread: bool,
    pub cpumask: Option<u64>,
    pub nice: Option<i32>,
}

impl Default for DepthOpts {
    fn default() -> Self {
        Self {
            iodepth: 1,
            iodepth_low: 0,
            iodepth_batch: 0,
            iodepth_batch_complete: 1,
            numjobs: 1,
            use_thread: true,
            cpumask: None,
            nice: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateCfg {
    pub rate_read: u64,
    pub rate_write: u64,
    pub ratemin_read: u64,
    pub ratemin_write: u64,
    pub rate_iops_read: u64,
    pub rate_iops_write: u64,
    pub rate_iops_min_read: u64,
    pub rate_iops_min_write: u64,
    /// Minimum-rate window, milliseconds
    pub ratecycle_ms: u64,
    pub no_stall: bool,
}

impl Default for RateCfg {
    fn default() -> Self {
        Self {
            rate_read: 0,
            rate_write: 0,
            ratemin_read: 0,
            ratemin_write: 0,
            rate_iops_read: 0,
            rate_iops_write: 0,
            rate_iops_min_read: 0,
            rate_iops_min_write: 0,
            ratecycle_ms: 1000,
            no_stall: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyOpts {
    pub verify: VerifyMode,
    /// Header interval within a block; 0 covers the block once
    pub verify_interval: u64,
    /// Header placement within each interval
    pub verify_offset: u64,
    /// Fixed pattern bytes; empty selects seeded payloads
    pub verify_pattern: Vec<u8>,
    pub verify_fatal: bool,
    pub verify_dump: bool,
    /// Verifier threads; 0 checks inline
    pub verify_async: usize,
    /// Unverified writes allowed before submissions stall; 0 is unbounded
    pub verify_backlog: usize,
    /// Entries drained per stall
    pub verify_batch: usize,
    pub verify_sort: bool,
}

impl Default for VerifyOpts {
    fn default() -> Self {
        Self {
            verify: VerifyMode::Off,
            verify_interval: 0,
            verify_offset: 0,
            verify_pattern: Vec::new(),
            verify_fatal: false,
            verify_dump: false,
            verify_async: 0,
            verify_backlog: 0,
            verify_batch: 16,
            verify_sort: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferOpts {
    pub mem_type: MemType,
    pub mem_align: usize,
    pub hugepage_size: usize,
    pub zero_buffers: bool,
    /// Regenerate the payload before every write
    pub refill_buffers: bool,
    /// Cheap per-I/O perturbation of otherwise identical payloads
    pub scramble_buffers: bool,
}

impl Default for BufferOpts {
    fn default() -> Self {
        Self {
            mem_type: MemType::Heap,
            mem_align: 4096,
            hugepage_size: 2 * 1024 * 1024,
            zero_buffers: false,
            refill_buffers: false,
            scramble_buffers: true,
        }
    }
}

/// Clock used for latency timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ClockSource {
    /// One monotonic clock read per timestamp
    #[default]
    Monotonic,
    /// Cached readings, refreshed periodically; cheaper, coarser
    Coarse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingOpts {
    pub disable_lat: bool,
    pub disable_clat: bool,
    pub disable_slat: bool,
    pub disable_bw: bool,
    /// Cache clock readings; trades latency precision for loop overhead
    pub gtod_reduce: bool,
    pub gtod_offload: bool,
    pub gtod_cpu: Option<u32>,
    pub clocksource: ClockSource,
    pub clat_percentiles: bool,
    pub percentile_list: Vec<f64>,
    /// Bandwidth averaging window, milliseconds
    pub bw_avg_time_ms: u64,
    pub write_lat_log: bool,
    pub write_bw_log: bool,
    /// Prefix of persisted log files
    pub log_prefix: String,
}

impl Default for TimingOpts {
    fn default() -> Self {
        Self {
            disable_lat: false,
            disable_clat: false,
            disable_slat: false,
            disable_bw: false,
            gtod_reduce: false,
            gtod_offload: false,
            gtod_cpu: None,
            clocksource: ClockSource::Monotonic,
            clat_percentiles: true,
            percentile_list: DEFAULT_PERCENTILES.to_vec(),
            bw_avg_time_ms: 500,
            write_lat_log: false,
            write_bw_log: false,
            log_prefix: String::from("iomill"),
        }
    }
}

/// The complete option set for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub name: String,
    pub ioengine: String,
    pub workload: WorkloadOpts,
    pub files: FileOpts,
    pub depth: DepthOpts,
    pub rate: RateCfg,
    pub verify: VerifyOpts,
    pub buffers: BufferOpts,
    pub timing: TimingOpts,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: String::from("job"),
            ioengine: String::from("sync"),
            workload: WorkloadOpts::default(),
            files: FileOpts::default(),
            depth: DepthOpts::default(),
            rate: RateCfg::default(),
            verify: VerifyOpts::default(),
            buffers: BufferOpts::default(),
            timing: TimingOpts::default(),
        }
    }
}

impl Options {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse job file")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read job file {}", path.display()))?;
        Self::from_toml(&text)
    }

    /// Per-direction size specs for the splitter.
    pub fn bs_specs(&self) -> [BsSpec; DDIR_COUNT] {
        let read = self.workload.bs.to_spec();
        let write = self
            .workload
            .bs_write
            .as_ref()
            .unwrap_or(&self.workload.bs)
            .to_spec();
        let trim = self
            .workload
            .bs_trim
            .as_ref()
            .or(self.workload.bs_write.as_ref())
            .unwrap_or(&self.workload.bs)
            .to_spec();
        [read, write, trim]
    }

    /// Per-direction alignments; unset aligns each direction to its min bs.
    pub fn bs_aligns(&self) -> [u64; DDIR_COUNT] {
        let specs = self.bs_specs();
        let mut out = [0u64; DDIR_COUNT];
        for (i, spec) in specs.iter().enumerate() {
            out[i] = if self.workload.ba > 0 {
                self.workload.ba
            } else {
                match spec {
                    BsSpec::Range { min, .. } => *min,
                    BsSpec::Split(entries) => {
                        entries.iter().map(|e| e.bs).min().unwrap_or(4096)
                    }
                }
            };
        }
        out
    }

    pub fn access_mode(&self) -> AccessMode {
        if self.workload.rw.is_random() {
            AccessMode::Random
        } else if self.workload.rw_seq_identical {
            AccessMode::Sequential(SeqMode::Identical)
        } else {
            AccessMode::Sequential(SeqMode::PerDirection)
        }
    }

    pub fn rand_kind(&self) -> RandKind {
        if self.workload.use_os_rand {
            RandKind::Os
        } else {
            RandKind::Fast
        }
    }

    pub fn rate_opts(&self) -> RateOpts {
        RateOpts {
            rate: [self.rate.rate_read, self.rate.rate_write],
            rate_iops: [self.rate.rate_iops_read, self.rate.rate_iops_write],
            ratemin: [self.rate.ratemin_read, self.rate.ratemin_write],
            rate_iops_min: [
                self.rate.rate_iops_min_read,
                self.rate.rate_iops_min_write,
            ],
            ratecycle_ms: self.rate.ratecycle_ms,
            no_stall: self.rate.no_stall,
        }
    }

    pub fn verify_params(&self) -> VerifyParams {
        VerifyParams {
            mode: self.verify.verify,
            pattern: self.verify.verify_pattern.clone(),
            interval: self.verify.verify_interval,
            header_offset: self.verify.verify_offset,
            fatal: self.verify.verify_fatal,
            dump: self.verify.verify_dump,
            dump_dir: self.files.directory.clone(),
        }
    }

    /// Path of file `idx` for worker `job`.
    pub fn file_path(&self, job: usize, idx: usize) -> PathBuf {
        match &self.files.filename {
            Some(name) => {
                if self.files.nr_files > 1 {
                    self.files
                        .directory
                        .join(format!("{}.{}", name.display(), idx))
                } else {
                    self.files.directory.join(name)
                }
            }
            None => self
                .files
                .directory
                .join(format!("{}.{}.{}", self.name, job, idx)),
        }
    }

    /// Total bytes of I/O one loop issues; 0 when unbounded (time based).
    pub fn total_io_size(&self) -> u64 {
        let per_file = if self.workload.size > 0 {
            self.workload.size
        } else {
            self.files.file_size
        };
        per_file.saturating_mul(self.files.nr_files as u64)
    }
}
