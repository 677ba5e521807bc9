//! Persisted sample logs
//!
//! Latency and bandwidth time series, one record per sample:
//! `timestamp_ms, value, direction, block_size`. Latency logs get one record
//! per I/O; bandwidth is averaged over `bw_avg_time` windows before a record
//! is emitted.

use super::JobStats;
use crate::engine::Ddir;
use std::io::{self, Write};
use std::path::Path;

/// What a log file records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Total latency per I/O (µs)
    Lat,
    /// Submission latency per I/O (µs)
    Slat,
    /// Completion latency per I/O (µs)
    Clat,
    /// Bandwidth window average (KiB/s)
    Bw,
}

impl LogKind {
    pub fn suffix(self) -> &'static str {
        match self {
            LogKind::Lat => "lat",
            LogKind::Slat => "slat",
            LogKind::Clat => "clat",
            LogKind::Bw => "bw",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSample {
    /// Milliseconds since the job epoch
    pub msec: u64,
    pub value: u64,
    pub ddir: Ddir,
    pub bs: u64,
}

/// An in-memory sample series, flushed to disk at job end
#[derive(Debug)]
pub struct SampleLog {
    kind: LogKind,
    samples: Vec<LogSample>,
}

impl SampleLog {
    pub fn new(kind: LogKind) -> Self {
        Self {
            kind,
            samples: Vec::new(),
        }
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    #[inline]
    pub fn add(&mut self, msec: u64, value: u64, ddir: Ddir, bs: u64) {
        self.samples.push(LogSample {
            msec,
            value,
            ddir,
            bs,
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[LogSample] {
        &self.samples
    }

    /// Drop everything recorded so far (ramp reset).
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn write_csv<W: Write>(&self, mut w: W) -> io::Result<()> {
        for s in &self.samples {
            writeln!(w, "{}, {}, {}, {}", s.msec, s.value, s.ddir.index(), s.bs)?;
        }
        Ok(())
    }

    /// Write to `<prefix>_<kind>.log`.
    pub fn persist(&self, dir: &Path, prefix: &str) -> io::Result<()> {
        let path = dir.join(format!("{}_{}.log", prefix, self.kind.suffix()));
        let file = std::fs::File::create(path)?;
        self.write_csv(io::BufWriter::new(file))
    }
}

/// Windows bandwidth into `bw_avg_time` averages
#[derive(Debug)]
pub struct BwTracker {
    window_ms: u64,
    window_start: [u64; 2],
    bytes: [u64; 2],
}

impl BwTracker {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            window_start: [0; 2],
            bytes: [0; 2],
        }
    }

    /// Account completed bytes; when a window fills, feed the average into
    /// the running bw stat and the sample log.
    pub fn account(
        &mut self,
        ddir: Ddir,
        bytes: u64,
        now_ms: u64,
        bs: u64,
        stats: &mut JobStats,
        log: Option<&mut SampleLog>,
    ) {
        let lane = ddir.rate_lane();
        self.bytes[lane] += bytes;

        let elapsed = now_ms.saturating_sub(self.window_start[lane]);
        if elapsed >= self.window_ms {
            let rate = self.bytes[lane] * 1000 / elapsed.max(1);
            stats.record_bw_sample(ddir, rate);
            if let Some(log) = log {
                log.add(now_ms, rate / 1024, ddir, bs);
            }
            self.window_start[lane] = now_ms;
            self.bytes[lane] = 0;
        }
    }

    pub fn reset(&mut self, now_ms: u64) {
        self.window_start = [now_ms; 2];
        self.bytes = [0; 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_record_shape() {
        let mut log = SampleLog::new(LogKind::Clat);
        log.add(12, 340, Ddir::Read, 4096);
        log.add(13, 99, Ddir::Write, 8192);

        let mut out = Vec::new();
        log.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "12, 340, 0, 4096\n13, 99, 1, 8192\n");
    }

    #[test]
    fn test_bw_window_averages() {
        let mut stats = JobStats::new();
        let mut log = SampleLog::new(LogKind::Bw);
        let mut bw = BwTracker::new(500);

        // 1 MiB over a 1000 ms window -> one sample of ~1 MiB/s
        bw.account(Ddir::Write, 512 * 1024, 400, 4096, &mut stats, Some(&mut log));
        assert!(log.is_empty());
        bw.account(Ddir::Write, 512 * 1024, 1000, 4096, &mut stats, Some(&mut log));

        assert_eq!(log.len(), 1);
        let s = &log.samples()[0];
        assert_eq!(s.value, 1024); // KiB/s
        assert_eq!(stats.bw[1].samples(), 1);
    }

    #[test]
    fn test_persist_writes_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SampleLog::new(LogKind::Lat);
        log.add(1, 2, Ddir::Read, 512);
        log.persist(dir.path(), "job0").unwrap();

        let content = std::fs::read_to_string(dir.path().join("job0_lat.log")).unwrap();
        assert_eq!(content, "1, 2, 0, 512\n");
    }

    #[test]
    fn test_reset_clears_samples() {
        let mut log = SampleLog::new(LogKind::Lat);
        log.add(1, 2, Ddir::Read, 512);
        log.reset();
        assert!(log.is_empty());
    }
}
