//! Timing helpers
//!
//! Microsecond conversions, human-readable formatting for the summary
//! printer, and a coarse cached clock for workloads that want to shave
//! clock_gettime calls out of the hot path.

use std::time::{Duration, Instant};

#[inline]
pub fn usecs(d: Duration) -> u64 {
    d.as_micros() as u64
}

#[inline]
pub fn msecs(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Format a byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut val = bytes as f64;
    let mut unit = 0;
    while val >= 1024.0 && unit < UNITS.len() - 1 {
        val /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", val, UNITS[unit])
    }
}

/// Format a bandwidth in bytes/s.
pub fn format_bw(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format a microsecond latency, scaling the unit to the magnitude.
pub fn format_usec(us: u64) -> String {
    if us >= 1_000_000 {
        format!("{:.2}s", us as f64 / 1_000_000.0)
    } else if us >= 1_000 {
        format!("{:.2}ms", us as f64 / 1_000.0)
    } else {
        format!("{}us", us)
    }
}

/// Clock that optionally caches readings to reduce timestamp overhead
///
/// With `reduce` off every call reads the real clock. With it on, the cached
/// value is refreshed once per `refresh_every` reads; latencies lose
/// precision but the submit loop sheds most of its clock calls.
#[derive(Debug)]
pub struct Clock {
    reduce: bool,
    refresh_every: u32,
    reads_left: u32,
    cached: Instant,
}

impl Clock {
    pub fn new(reduce: bool) -> Self {
        Self {
            reduce,
            refresh_every: 16,
            reads_left: 0,
            cached: Instant::now(),
        }
    }

    #[inline]
    pub fn now(&mut self) -> Instant {
        if !self.reduce {
            return Instant::now();
        }
        if self.reads_left == 0 {
            self.cached = Instant::now();
            self.reads_left = self.refresh_every;
        }
        self.reads_left -= 1;
        self.cached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(4096), "4.00 KiB");
        assert_eq!(format_bytes(1048576), "1.00 MiB");
    }

    #[test]
    fn test_format_usec_scales() {
        assert_eq!(format_usec(500), "500us");
        assert_eq!(format_usec(1500), "1.50ms");
        assert_eq!(format_usec(2_500_000), "2.50s");
    }

    #[test]
    fn test_cached_clock_monotonic() {
        let mut clock = Clock::new(true);
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        // Burn through the cache window
        let mut b = clock.now();
        for _ in 0..32 {
            b = clock.now();
        }
        assert!(b >= a);
    }
}
