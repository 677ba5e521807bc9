//! Process accounting
//!
//! Snapshots of per-thread resource usage taken at stats start and end; the
//! delta lands in the final report (CPU split, context switches, faults).

/// One `getrusage` snapshot, microsecond CPU times
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub user_us: u64,
    pub sys_us: u64,
    pub minflt: u64,
    pub majflt: u64,
    /// Voluntary context switches
    pub nvcsw: u64,
    /// Involuntary context switches
    pub nivcsw: u64,
}

impl ResourceUsage {
    /// Snapshot the calling thread's usage. `None` if the syscall fails.
    pub fn snapshot() -> Option<Self> {
        #[cfg(target_os = "linux")]
        let who = libc::RUSAGE_THREAD;
        #[cfg(not(target_os = "linux"))]
        let who = libc::RUSAGE_SELF;

        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::getrusage(who, &mut ru) };
        if ret != 0 {
            return None;
        }

        let tv_us = |tv: libc::timeval| tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64;
        Some(Self {
            user_us: tv_us(ru.ru_utime),
            sys_us: tv_us(ru.ru_stime),
            minflt: ru.ru_minflt as u64,
            majflt: ru.ru_majflt as u64,
            nvcsw: ru.ru_nvcsw as u64,
            nivcsw: ru.ru_nivcsw as u64,
        })
    }

    /// Usage accumulated since `earlier`.
    pub fn delta(&self, earlier: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            user_us: self.user_us.saturating_sub(earlier.user_us),
            sys_us: self.sys_us.saturating_sub(earlier.sys_us),
            minflt: self.minflt.saturating_sub(earlier.minflt),
            majflt: self.majflt.saturating_sub(earlier.majflt),
            nvcsw: self.nvcsw.saturating_sub(earlier.nvcsw),
            nivcsw: self.nivcsw.saturating_sub(earlier.nivcsw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_succeeds() {
        assert!(ResourceUsage::snapshot().is_some());
    }

    #[test]
    fn test_delta_is_monotonic() {
        let a = ResourceUsage::snapshot().unwrap();
        // Burn a little CPU so user time advances somewhere.
        let mut x = 0u64;
        for i in 0..500_000u64 {
            x = x.wrapping_add(i * i);
        }
        std::hint::black_box(x);
        let b = ResourceUsage::snapshot().unwrap();
        let d = b.delta(&a);
        assert!(d.user_us < 60_000_000);
    }
}
