//! Option validation
//!
//! Rejects inconsistent option sets before any worker starts; a failure here
//! maps to exit code 2.

use super::Options;
use crate::error::JobError;
use crate::gen::bs::BsSpec;
use crate::verify::{VerifyMode, HEADER_SIZE, MAX_PATTERN_SIZE};

/// Maximum entries in a custom percentile list
pub const MAX_PERCENTILES: usize = 20;

fn invalid(msg: String) -> JobError {
    JobError::ConfigInvalid(msg)
}

/// Check an option set for internal consistency.
pub fn validate(opts: &Options) -> Result<(), JobError> {
    if opts.name.is_empty() {
        return Err(invalid("job name must not be empty".into()));
    }
    if opts.depth.numjobs == 0 {
        return Err(invalid("numjobs must be at least 1".into()));
    }
    if opts.depth.iodepth == 0 {
        return Err(invalid("iodepth must be at least 1".into()));
    }
    if opts.depth.iodepth_low > opts.depth.iodepth {
        return Err(invalid("iodepth_low cannot exceed iodepth".into()));
    }
    if opts.files.nr_files == 0 {
        return Err(invalid("nr_files must be at least 1".into()));
    }
    if opts.files.file_size == 0 && opts.workload.size == 0 {
        return Err(invalid(
            "either file_size or workload size must be set".into(),
        ));
    }
    if opts.files.file_size_high > 0 && opts.files.file_size_high < opts.files.file_size {
        return Err(invalid("file_size_high is below file_size".into()));
    }

    for spec in opts.bs_specs() {
        match spec {
            BsSpec::Range { min, max } => {
                if min == 0 {
                    return Err(invalid("block size must be non-zero".into()));
                }
                if max < min {
                    return Err(invalid("max block size is below min".into()));
                }
            }
            BsSpec::Split(entries) => {
                if entries.is_empty() {
                    return Err(invalid("bssplit must name at least one size".into()));
                }
                let sum: u32 = entries.iter().map(|e| e.perc).sum();
                if sum != 100 {
                    return Err(invalid(format!(
                        "bssplit percentages sum to {}, expected 100",
                        sum
                    )));
                }
                if entries.iter().any(|e| e.bs == 0) {
                    return Err(invalid("bssplit block size must be non-zero".into()));
                }
            }
        }
    }

    if opts.workload.rwmix_read > 100 {
        return Err(invalid("rwmix_read is a percentage (0-100)".into()));
    }
    if opts.workload.trim_percentage > 100 {
        return Err(invalid("trim_percentage is a percentage (0-100)".into()));
    }
    if opts.workload.zone_skip > 0 && opts.workload.zone_size == 0 {
        return Err(invalid("zone_skip without zone_size".into()));
    }
    if opts.workload.time_based && opts.workload.runtime_ms == 0 {
        return Err(invalid("time_based requires a runtime".into()));
    }
    if opts.workload.loops == 0 {
        return Err(invalid("loops must be at least 1".into()));
    }

    // Rate floors above their matching caps can never be met.
    let r = &opts.rate;
    for (min, cap, what) in [
        (r.ratemin_read, r.rate_read, "read byte"),
        (r.ratemin_write, r.rate_write, "write byte"),
        (r.rate_iops_min_read, r.rate_iops_read, "read iops"),
        (r.rate_iops_min_write, r.rate_iops_write, "write iops"),
    ] {
        if min > 0 && cap > 0 && min > cap {
            return Err(invalid(format!("minimum {} rate exceeds its cap", what)));
        }
    }

    if opts.verify.verify.enabled() {
        if !opts.workload.rw.writes() {
            return Err(invalid("verification requires a workload that writes".into()));
        }
        if opts.verify.verify_pattern.len() > MAX_PATTERN_SIZE {
            return Err(invalid(format!(
                "verify_pattern is limited to {} bytes",
                MAX_PATTERN_SIZE
            )));
        }
        let min_bs = match &opts.bs_specs()[1] {
            BsSpec::Range { min, .. } => *min,
            BsSpec::Split(entries) => entries.iter().map(|e| e.bs).min().unwrap_or(0),
        };
        if min_bs < HEADER_SIZE as u64 {
            return Err(invalid(format!(
                "write block size must fit a {} byte verify header",
                HEADER_SIZE
            )));
        }
        if opts.verify.verify_interval > 0 && opts.verify.verify_interval < HEADER_SIZE as u64 {
            return Err(invalid("verify_interval below the header size".into()));
        }
        if opts.verify.verify_offset > 0
            && opts.verify.verify_interval > 0
            && opts.verify.verify_offset + HEADER_SIZE as u64 > opts.verify.verify_interval
        {
            return Err(invalid("verify_offset pushes the header out of the interval".into()));
        }
        if opts.verify.verify_backlog > 0 && opts.verify.verify_batch == 0 {
            return Err(invalid("verify_backlog requires a non-zero verify_batch".into()));
        }
    }

    let plist = &opts.timing.percentile_list;
    if plist.len() > MAX_PERCENTILES {
        return Err(invalid(format!(
            "percentile list is limited to {} entries",
            MAX_PERCENTILES
        )));
    }
    if plist.iter().any(|&p| p <= 0.0 || p > 100.0) {
        return Err(invalid("percentiles must lie in (0, 100]".into()));
    }

    if opts.buffers.mem_align == 0 || !opts.buffers.mem_align.is_power_of_two() {
        return Err(invalid("mem_align must be a power of two".into()));
    }
    if opts.buffers.zero_buffers && opts.verify.verify == VerifyMode::Pattern
        && opts.verify.verify_pattern.is_empty()
    {
        return Err(invalid(
            "zero_buffers conflicts with seeded pattern verification".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BsConfig, RwKind, SplitConfig};

    fn base() -> Options {
        let mut opts = Options::default();
        opts.files.file_size = 1 << 20;
        opts
    }

    #[test]
    fn test_defaults_validate() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn test_zero_depth_rejected() {
        let mut opts = base();
        opts.depth.iodepth = 0;
        assert!(validate(&opts).is_err());
    }

    #[test]
    fn test_split_must_sum_to_100() {
        let mut opts = base();
        opts.workload.bs.split = vec![
            SplitConfig { bs: 4096, perc: 60 },
            SplitConfig { bs: 8192, perc: 30 },
        ];
        let err = validate(&opts).unwrap_err();
        assert!(err.to_string().contains("90"));
    }

    #[test]
    fn test_verify_needs_writes() {
        let mut opts = base();
        opts.workload.rw = RwKind::Read;
        opts.verify.verify = crate::verify::VerifyMode::Crc32;
        assert!(validate(&opts).is_err());

        opts.workload.rw = RwKind::Write;
        assert!(validate(&opts).is_ok());
    }

    #[test]
    fn test_verify_header_needs_room() {
        let mut opts = base();
        opts.workload.rw = RwKind::Write;
        opts.workload.bs = BsConfig::fixed(16);
        opts.verify.verify = crate::verify::VerifyMode::Crc32;
        assert!(validate(&opts).is_err());
    }

    #[test]
    fn test_min_rate_above_cap_rejected() {
        let mut opts = base();
        opts.rate.rate_write = 1 << 20;
        opts.rate.ratemin_write = 1 << 21;
        assert!(validate(&opts).is_err());
    }

    #[test]
    fn test_percentile_list_bounds() {
        let mut opts = base();
        opts.timing.percentile_list = vec![50.0; 21];
        assert!(validate(&opts).is_err());

        opts.timing.percentile_list = vec![0.0];
        assert!(validate(&opts).is_err());

        opts.timing.percentile_list = vec![99.9];
        assert!(validate(&opts).is_ok());
    }

    #[test]
    fn test_time_based_needs_runtime() {
        let mut opts = base();
        opts.workload.time_based = true;
        assert!(validate(&opts).is_err());
        opts.workload.runtime_ms = 1000;
        assert!(validate(&opts).is_ok());
    }
}
