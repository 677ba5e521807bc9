//! Rate limiter
//!
//! Token pacing per direction lane (reads; writes+trims), tracking a byte
//! rate and an IOPS rate at the same time. After every completion the ideal
//! elapsed time under each configured limit is computed; pacing follows the
//! larger ideal, so whichever limit is hit first governs. The deficit is
//! accumulated and slept off only once it crosses a flush threshold, keeping
//! syscall overhead amortized at high IOPS.
//!
//! Minimum rates are enforced over sliding `ratecycle` windows: one full
//! window below the floor fails the job.

use crate::error::JobError;
use std::time::{Duration, Instant};

/// Pacing lanes: reads, writes (trims share the write lane)
pub const RATE_LANES: usize = 2;

/// Accumulated sleep below this is carried instead of paid immediately
const SLEEP_FLUSH_NS: u64 = 100_000;

/// Rate configuration for one job
#[derive(Debug, Clone, Default)]
pub struct RateOpts {
    /// Bytes per second per lane; 0 disables
    pub rate: [u64; RATE_LANES],
    /// I/Os per second per lane; 0 disables
    pub rate_iops: [u64; RATE_LANES],
    /// Minimum bytes per second per lane; 0 disables enforcement
    pub ratemin: [u64; RATE_LANES],
    /// Minimum I/Os per second per lane; 0 disables enforcement
    pub rate_iops_min: [u64; RATE_LANES],
    /// Width of the minimum-rate window, milliseconds
    pub ratecycle_ms: u64,
    /// Never sleep; caps become advisory
    pub no_stall: bool,
}

impl RateOpts {
    pub fn any_cap(&self) -> bool {
        self.rate.iter().any(|&r| r > 0) || self.rate_iops.iter().any(|&r| r > 0)
    }

    pub fn any_min(&self) -> bool {
        self.ratemin.iter().any(|&r| r > 0) || self.rate_iops_min.iter().any(|&r| r > 0)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    opts: RateOpts,
    start: Instant,
    bytes: [u64; RATE_LANES],
    ios: [u64; RATE_LANES],
    window_start: Instant,
    window_bytes: [u64; RATE_LANES],
    window_ios: [u64; RATE_LANES],
}

impl RateLimiter {
    pub fn new(opts: RateOpts, now: Instant) -> Self {
        Self {
            opts,
            start: now,
            bytes: [0; RATE_LANES],
            ios: [0; RATE_LANES],
            window_start: now,
            window_bytes: [0; RATE_LANES],
            window_ios: [0; RATE_LANES],
        }
    }

    pub fn active(&self) -> bool {
        self.opts.any_cap() || self.opts.any_min()
    }

    /// Account one completion and return the sleep owed, if it is worth
    /// paying yet. With `no_stall` the deficit is tracked but never returned.
    pub fn on_complete(&mut self, lane: usize, bytes: u64, now: Instant) -> Option<Duration> {
        self.bytes[lane] += bytes;
        self.ios[lane] += 1;

        if self.opts.no_stall {
            return None;
        }

        let mut ideal_ns = 0u64;
        if self.opts.rate[lane] > 0 {
            ideal_ns = self.bytes[lane]
                .saturating_mul(1_000_000_000)
                / self.opts.rate[lane];
        }
        if self.opts.rate_iops[lane] > 0 {
            let by_iops = self.ios[lane].saturating_mul(1_000_000_000) / self.opts.rate_iops[lane];
            // Intersect the limits: pace on whichever is slower.
            ideal_ns = ideal_ns.max(by_iops);
        }
        if ideal_ns == 0 {
            return None;
        }

        let actual_ns = now.duration_since(self.start).as_nanos() as u64;
        let pending = ideal_ns.saturating_sub(actual_ns);
        if pending >= SLEEP_FLUSH_NS {
            Some(Duration::from_nanos(pending))
        } else {
            None
        }
    }

    /// Enforce minimum rates. Call often; only full windows are judged.
    pub fn check_min(&mut self, now: Instant) -> Result<(), JobError> {
        if !self.opts.any_min() {
            return Ok(());
        }
        let elapsed_ms = now.duration_since(self.window_start).as_millis() as u64;
        if elapsed_ms < self.opts.ratecycle_ms.max(1) {
            return Ok(());
        }

        for lane in 0..RATE_LANES {
            let bytes = self.bytes[lane] - self.window_bytes[lane];
            let ios = self.ios[lane] - self.window_ios[lane];

            if self.opts.ratemin[lane] > 0 {
                let got = bytes * 1000 / elapsed_ms;
                if got < self.opts.ratemin[lane] {
                    return Err(JobError::RateTooLow {
                        got,
                        min: self.opts.ratemin[lane],
                    });
                }
            }
            if self.opts.rate_iops_min[lane] > 0 {
                let got = ios * 1000 / elapsed_ms;
                if got < self.opts.rate_iops_min[lane] {
                    return Err(JobError::RateTooLow {
                        got,
                        min: self.opts.rate_iops_min[lane],
                    });
                }
            }
        }

        self.window_start = now;
        self.window_bytes = self.bytes;
        self.window_ios = self.ios;
        Ok(())
    }

    /// Restart pacing from `now` (phase change, ramp expiry).
    pub fn reset(&mut self, now: Instant) {
        self.start = now;
        self.bytes = [0; RATE_LANES];
        self.ios = [0; RATE_LANES];
        self.window_start = now;
        self.window_bytes = [0; RATE_LANES];
        self.window_ios = [0; RATE_LANES];
    }
}
