//! Statistics collection
//!
//! Per-worker statistics: running min/max/mean/variance per direction for
//! submission, completion and total latency plus bandwidth, the log-linear
//! percentile histograms, coarse linear latency distributions, queue-depth
//! maps, error accounting, and process accounting snapshots. Workers own
//! their stats privately; the supervisor reads them only after the worker
//! has exited.

pub mod histogram;
pub mod log;

use crate::engine::Ddir;
use crate::error::ErrorSlot;
use crate::util::resource::ResourceUsage;
use histogram::PlatHistogram;
use std::time::Duration;

/// Directions with full latency accounting (read, write); trims fold into
/// the write slot.
pub const LAT_DIRS: usize = 2;

/// Linear microsecond latency distribution boundaries (≤ 1 ms)
pub const LAT_U_BOUNDS: [u64; 10] = [2, 4, 10, 20, 50, 100, 250, 500, 750, 1000];
/// Linear millisecond latency distribution boundaries
pub const LAT_M_BOUNDS: [u64; 12] = [2, 4, 10, 20, 50, 100, 250, 500, 750, 1000, 2000, u64::MAX];

/// Queue-depth map bin floors (1, 2, 4, ..., ≥ 64)
pub const DEPTH_BINS: usize = 7;

/// Default percentile list for reporting
pub const DEFAULT_PERCENTILES: [f64; 15] = [
    1.0, 5.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 95.0, 99.0, 99.5, 99.9,
];

/// Running sample statistics: O(1) insert, mean and deviation on demand
#[derive(Debug, Clone)]
pub struct IoStat {
    min: u64,
    max: u64,
    sum: u64,
    sum_sq: u128,
    samples: u64,
}

impl IoStat {
    pub fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            sum_sq: 0,
            samples: 0,
        }
    }

    #[inline]
    pub fn add(&mut self, val: u64) {
        self.min = self.min.min(val);
        self.max = self.max.max(val);
        self.sum += val;
        self.sum_sq += (val as u128) * (val as u128);
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn min(&self) -> Option<u64> {
        (self.samples > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<u64> {
        (self.samples > 0).then_some(self.max)
    }

    pub fn mean(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.sum as f64 / self.samples as f64
    }

    /// Sample standard deviation
    pub fn stddev(&self) -> f64 {
        if self.samples < 2 {
            return 0.0;
        }
        let n = self.samples as f64;
        let mean = self.mean();
        let var = (self.sum_sq as f64 - n * mean * mean) / (n - 1.0);
        var.max(0.0).sqrt()
    }

    pub fn merge(&mut self, other: &IoStat) {
        if other.samples == 0 {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.samples += other.samples;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for IoStat {
    fn default() -> Self {
        Self::new()
    }
}

/// Bin for a queue depth in the 7-slot logarithmic map
#[inline]
pub fn depth_bin(depth: usize) -> usize {
    match depth {
        0 | 1 => 0,
        2..=3 => 1,
        4..=7 => 2,
        8..=15 => 3,
        16..=31 => 4,
        32..=63 => 5,
        _ => 6,
    }
}

fn linear_bin(bounds: &[u64], val: u64) -> usize {
    bounds
        .iter()
        .position(|&b| val <= b)
        .unwrap_or(bounds.len() - 1)
}

/// Everything a worker accumulates over a run
#[derive(Debug, Clone)]
pub struct JobStats {
    /// Completion latency (µs) per direction
    pub clat: [IoStat; LAT_DIRS],
    /// Submission latency (µs) per direction
    pub slat: [IoStat; LAT_DIRS],
    /// Total latency (µs) per direction
    pub lat: [IoStat; LAT_DIRS],
    /// Bandwidth window samples (bytes/s) per direction
    pub bw: [IoStat; LAT_DIRS],
    /// Percentile histograms per direction
    pub plat: [PlatHistogram; LAT_DIRS],

    /// Linear microsecond latency distribution
    pub lat_u: [u64; LAT_U_BOUNDS.len()],
    /// Linear millisecond latency distribution
    pub lat_m: [u64; LAT_M_BOUNDS.len()],

    /// Depth observed at submission time
    pub depth_submit: [u64; DEPTH_BINS],
    /// Depth observed when reaping
    pub depth_complete: [u64; DEPTH_BINS],
    /// In-flight depth sampled per iteration
    pub depth_map: [u64; DEPTH_BINS],

    /// Completed I/Os per data direction (read/write/trim)
    pub total_ios: [u64; 3],
    /// I/Os that transferred fewer bytes than asked
    pub short_ios: [u64; 3],
    /// Bytes completed per data direction; monotonic
    pub io_bytes: [u64; 3],

    pub total_submissions: u64,
    pub total_completions: u64,

    /// Error slot: first error + monotonic count
    pub errors: ErrorSlot,

    /// Process accounting at stats start and end
    pub ru_start: Option<ResourceUsage>,
    pub ru_end: Option<ResourceUsage>,

    /// Wall time covered by these stats
    pub runtime: Duration,
}

impl JobStats {
    pub fn new() -> Self {
        Self {
            clat: [IoStat::new(), IoStat::new()],
            slat: [IoStat::new(), IoStat::new()],
            lat: [IoStat::new(), IoStat::new()],
            bw: [IoStat::new(), IoStat::new()],
            plat: [PlatHistogram::new(), PlatHistogram::new()],
            lat_u: [0; LAT_U_BOUNDS.len()],
            lat_m: [0; LAT_M_BOUNDS.len()],
            depth_submit: [0; DEPTH_BINS],
            depth_complete: [0; DEPTH_BINS],
            depth_map: [0; DEPTH_BINS],
            total_ios: [0; 3],
            short_ios: [0; 3],
            io_bytes: [0; 3],
            total_submissions: 0,
            total_completions: 0,
            errors: ErrorSlot::new(),
            ru_start: None,
            ru_end: None,
            runtime: Duration::ZERO,
        }
    }

    #[inline]
    fn lane(ddir: Ddir) -> usize {
        match ddir {
            Ddir::Read => 0,
            _ => 1,
        }
    }

    /// Record a completed data I/O. Latencies arrive as `None` when their
    /// measurement is disabled; byte and count accounting always happens.
    pub fn record_io(
        &mut self,
        ddir: Ddir,
        bytes: u64,
        requested: u64,
        slat_us: Option<u64>,
        clat_us: Option<u64>,
    ) {
        let lane = Self::lane(ddir);

        if let Some(c) = clat_us {
            self.clat[lane].add(c);
            self.plat[lane].record(c);
        }
        if let Some(s) = slat_us {
            self.slat[lane].add(s);
        }
        if clat_us.is_some() || slat_us.is_some() {
            let lat_us = clat_us.unwrap_or(0) + slat_us.unwrap_or(0);
            self.lat[lane].add(lat_us);
            if lat_us <= 1000 {
                self.lat_u[linear_bin(&LAT_U_BOUNDS, lat_us)] += 1;
            } else {
                self.lat_m[linear_bin(&LAT_M_BOUNDS, lat_us / 1000)] += 1;
            }
        }

        let slot = ddir.index();
        self.total_ios[slot] += 1;
        self.io_bytes[slot] += bytes;
        if bytes < requested {
            self.short_ios[slot] += 1;
        }
    }

    pub fn record_submit_depth(&mut self, depth: usize) {
        self.depth_submit[depth_bin(depth)] += 1;
        self.total_submissions += 1;
    }

    pub fn record_complete_depth(&mut self, depth: usize) {
        self.depth_complete[depth_bin(depth)] += 1;
        self.total_completions += 1;
    }

    pub fn record_queue_depth(&mut self, depth: usize) {
        self.depth_map[depth_bin(depth)] += 1;
    }

    /// One bandwidth window sample, bytes/s.
    pub fn record_bw_sample(&mut self, ddir: Ddir, bytes_per_sec: u64) {
        self.bw[Self::lane(ddir)].add(bytes_per_sec);
    }

    pub fn snapshot_rusage_start(&mut self) {
        self.ru_start = ResourceUsage::snapshot();
    }

    pub fn snapshot_rusage_end(&mut self) {
        self.ru_end = ResourceUsage::snapshot();
    }

    pub fn rusage_delta(&self) -> Option<ResourceUsage> {
        match (&self.ru_start, &self.ru_end) {
            (Some(a), Some(b)) => Some(b.delta(a)),
            _ => None,
        }
    }

    /// Discard everything accumulated so far (end of ramp). Keeps the error
    /// slot, which is monotonic across the whole job.
    pub fn reset(&mut self) {
        let errors = self.errors.clone();
        *self = Self::new();
        self.errors = errors;
        self.snapshot_rusage_start();
    }

    /// Fold another worker's stats into this aggregate.
    pub fn merge(&mut self, other: &JobStats) {
        for i in 0..LAT_DIRS {
            self.clat[i].merge(&other.clat[i]);
            self.slat[i].merge(&other.slat[i]);
            self.lat[i].merge(&other.lat[i]);
            self.bw[i].merge(&other.bw[i]);
            self.plat[i].merge(&other.plat[i]);
        }
        for i in 0..self.lat_u.len() {
            self.lat_u[i] += other.lat_u[i];
        }
        for i in 0..self.lat_m.len() {
            self.lat_m[i] += other.lat_m[i];
        }
        for i in 0..DEPTH_BINS {
            self.depth_submit[i] += other.depth_submit[i];
            self.depth_complete[i] += other.depth_complete[i];
            self.depth_map[i] += other.depth_map[i];
        }
        for i in 0..3 {
            self.total_ios[i] += other.total_ios[i];
            self.short_ios[i] += other.short_ios[i];
            self.io_bytes[i] += other.io_bytes[i];
        }
        self.total_submissions += other.total_submissions;
        self.total_completions += other.total_completions;
        self.errors.merge(&other.errors);
        self.runtime = self.runtime.max(other.runtime);
    }
}

impl Default for JobStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iostat_running_moments() {
        let mut s = IoStat::new();
        for v in [100u64, 200, 300] {
            s.add(v);
        }
        assert_eq!(s.min(), Some(100));
        assert_eq!(s.max(), Some(300));
        assert!((s.mean() - 200.0).abs() < 1e-9);
        assert!((s.stddev() - 100.0).abs() < 1e-9);
        assert_eq!(s.samples(), 3);
    }

    #[test]
    fn test_histogram_count_matches_stat_count() {
        let mut stats = JobStats::new();
        for i in 0..256 {
            stats.record_io(Ddir::Read, 4096, 4096, Some(5), Some(100 + i));
        }
        for i in 0..100 {
            stats.record_io(Ddir::Write, 4096, 4096, None, Some(50 + i));
        }
        assert_eq!(stats.plat[0].total(), stats.clat[0].samples());
        assert_eq!(stats.plat[1].total(), stats.clat[1].samples());
    }

    #[test]
    fn test_io_bytes_accumulates_per_direction() {
        let mut stats = JobStats::new();
        stats.record_io(Ddir::Write, 4096, 4096, None, Some(10));
        stats.record_io(Ddir::Write, 4096, 4096, None, Some(10));
        stats.record_io(Ddir::Read, 8192, 8192, None, Some(10));
        stats.record_io(Ddir::Trim, 4096, 4096, None, Some(10));

        assert_eq!(stats.io_bytes[Ddir::Write.index()], 8192);
        assert_eq!(stats.io_bytes[Ddir::Read.index()], 8192);
        assert_eq!(stats.io_bytes[Ddir::Trim.index()], 4096);
        assert_eq!(stats.total_ios, [1, 2, 1]);
    }

    #[test]
    fn test_short_io_detection() {
        let mut stats = JobStats::new();
        stats.record_io(Ddir::Read, 1024, 4096, None, Some(10));
        assert_eq!(stats.short_ios[0], 1);
    }

    #[test]
    fn test_depth_bins() {
        assert_eq!(depth_bin(1), 0);
        assert_eq!(depth_bin(2), 1);
        assert_eq!(depth_bin(3), 1);
        assert_eq!(depth_bin(4), 2);
        assert_eq!(depth_bin(15), 3);
        assert_eq!(depth_bin(32), 5);
        assert_eq!(depth_bin(64), 6);
        assert_eq!(depth_bin(1000), 6);
    }

    #[test]
    fn test_linear_latency_routing() {
        let mut stats = JobStats::new();
        stats.record_io(Ddir::Read, 4096, 4096, None, Some(500));
        stats.record_io(Ddir::Read, 4096, 4096, None, Some(5_000));

        let u_total: u64 = stats.lat_u.iter().sum();
        let m_total: u64 = stats.lat_m.iter().sum();
        assert_eq!(u_total, 1);
        assert_eq!(m_total, 1);
    }

    #[test]
    fn test_reset_keeps_errors() {
        use crate::error::JobError;
        let mut stats = JobStats::new();
        stats.record_io(Ddir::Read, 4096, 4096, None, Some(10));
        stats.errors.record(JobError::Timeout, "test");

        stats.reset();
        assert_eq!(stats.total_ios[0], 0);
        assert_eq!(stats.errors.count(), 1);
    }

    #[test]
    fn test_merge_accumulates() {
        let mut a = JobStats::new();
        let mut b = JobStats::new();
        a.record_io(Ddir::Read, 4096, 4096, None, Some(100));
        b.record_io(Ddir::Read, 4096, 4096, None, Some(300));

        a.merge(&b);
        assert_eq!(a.total_ios[0], 2);
        assert_eq!(a.clat[0].samples(), 2);
        assert_eq!(a.io_bytes[0], 8192);
    }
}
