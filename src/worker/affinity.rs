//! CPU placement and priority
//!
//! Applies the `cpumask` and `nice` options to the calling worker thread.

use crate::Result;
use anyhow::bail;

/// Pin the calling thread to the CPUs set in `mask` (bit N = CPU N).
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(mask: u64) -> Result<()> {
    if mask == 0 {
        bail!("cpumask selects no CPUs");
    }
    // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for cpu in 0..64 {
        if mask & (1u64 << cpu) != 0 {
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
    }
    let ret = unsafe {
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        bail!(
            "sched_setaffinity failed: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_mask: u64) -> Result<()> {
    bail!("cpu affinity is only supported on linux");
}

/// Adjust the scheduling priority of the calling thread.
pub fn set_nice(nice: i32) -> Result<()> {
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // setpriority legitimately returns -1 with errno 0 for nice == -1
        if err.raw_os_error().unwrap_or(0) != 0 {
            bail!("setpriority failed: {}", err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_affinity_to_current_cpu() {
        // CPU 0 exists everywhere this test runs.
        assert!(set_cpu_affinity(0b1).is_ok());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_empty_mask_rejected() {
        assert!(set_cpu_affinity(0).is_err());
    }
}
