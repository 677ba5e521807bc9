//! Final report rendering
//!
//! Human-readable summary of a run (per-direction throughput, IOPS,
//! latency moments and percentiles, the coarse latency distribution and the
//! queue-depth map, CPU accounting, errors) plus a machine-readable JSON
//! dump of the same numbers.

use crate::config::Options;
use crate::coordinator::RunSummary;
use crate::engine::Ddir;
use crate::stats::{JobStats, DEPTH_BINS, LAT_M_BOUNDS, LAT_U_BOUNDS};
use crate::util::time::{format_bw, format_bytes, format_usec};
use serde_json::json;
use std::io::{self, Write};

const DIR_NAMES: [&str; 2] = ["read", "write"];
const DEPTH_LABELS: [&str; DEPTH_BINS] = ["1", "2", "4", "8", "16", "32", ">=64"];

/// Render the summary to any sink.
pub fn write_summary<W: Write>(mut w: W, summary: &RunSummary, opts: &Options) -> io::Result<()> {
    let stats = &summary.aggregate;
    let secs = summary.elapsed.as_secs_f64().max(1e-9);

    writeln!(w, "{}: engine={}, jobs={}", opts.name, opts.ioengine, opts.depth.numjobs)?;

    for lane in 0..2 {
        let ios = if lane == 0 {
            stats.total_ios[0]
        } else {
            stats.total_ios[1] + stats.total_ios[2]
        };
        let bytes = if lane == 0 {
            stats.io_bytes[0]
        } else {
            stats.io_bytes[1] + stats.io_bytes[2]
        };
        if ios == 0 {
            continue;
        }

        writeln!(
            w,
            "  {}: io={}, bw={}, iops={:.0}, runtime={:.0}ms",
            DIR_NAMES[lane],
            format_bytes(bytes),
            format_bw(bytes as f64 / secs),
            ios as f64 / secs,
            summary.elapsed.as_millis()
        )?;

        let clat = &stats.clat[lane];
        if clat.samples() > 0 {
            writeln!(
                w,
                "    clat ({}): min={}, max={}, avg={:.2}, stdev={:.2}",
                clat.samples(),
                format_usec(clat.min().unwrap_or(0)),
                format_usec(clat.max().unwrap_or(0)),
                clat.mean(),
                clat.stddev()
            )?;
        }
        let slat = &stats.slat[lane];
        if slat.samples() > 0 {
            writeln!(
                w,
                "    slat ({}): min={}, max={}, avg={:.2}, stdev={:.2}",
                slat.samples(),
                format_usec(slat.min().unwrap_or(0)),
                format_usec(slat.max().unwrap_or(0)),
                slat.mean(),
                slat.stddev()
            )?;
        }

        if opts.timing.clat_percentiles && !stats.plat[lane].is_empty() {
            writeln!(w, "    clat percentiles (usec):")?;
            for chunk in stats
                .plat[lane]
                .percentiles(&opts.timing.percentile_list)
                .chunks(5)
            {
                let line: Vec<String> = chunk
                    .iter()
                    .map(|(p, v)| format!("{:>6.2}th=[{:>8}]", p, v))
                    .collect();
                writeln!(w, "      {}", line.join(", "))?;
            }
        }

        let bw = &stats.bw[lane];
        if bw.samples() > 0 {
            writeln!(
                w,
                "    bw ({} samples): min={}, max={}, avg={}",
                bw.samples(),
                format_bw(bw.min().unwrap_or(0) as f64),
                format_bw(bw.max().unwrap_or(0) as f64),
                format_bw(bw.mean())
            )?;
        }
    }

    if stats.total_ios[2] > 0 {
        writeln!(
            w,
            "  trim: ios={}, bytes={}",
            stats.total_ios[2],
            format_bytes(stats.io_bytes[2])
        )?;
    }

    // Latency distribution, omitting empty bins
    let total_lat: u64 = stats.lat_u.iter().sum::<u64>() + stats.lat_m.iter().sum::<u64>();
    if total_lat > 0 {
        let pct = |n: u64| 100.0 * n as f64 / total_lat as f64;
        let mut parts = Vec::new();
        for (i, &count) in stats.lat_u.iter().enumerate() {
            if count > 0 {
                parts.push(format!("{}={:.2}%", LAT_U_BOUNDS[i], pct(count)));
            }
        }
        if !parts.is_empty() {
            writeln!(w, "  lat (usec): {}", parts.join(", "))?;
        }
        parts.clear();
        for (i, &count) in stats.lat_m.iter().enumerate() {
            if count > 0 {
                let label = if LAT_M_BOUNDS[i] == u64::MAX {
                    ">=2000".to_string()
                } else {
                    LAT_M_BOUNDS[i].to_string()
                };
                parts.push(format!("{}={:.2}%", label, pct(count)));
            }
        }
        if !parts.is_empty() {
            writeln!(w, "  lat (msec): {}", parts.join(", "))?;
        }
    }

    // Queue depth map
    let depth_total: u64 = stats.depth_map.iter().sum();
    if depth_total > 0 {
        let parts: Vec<String> = stats
            .depth_map
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(i, &c)| {
                format!(
                    "{}={:.1}%",
                    DEPTH_LABELS[i],
                    100.0 * c as f64 / depth_total as f64
                )
            })
            .collect();
        writeln!(w, "  IO depths: {}", parts.join(", "))?;
    }
    writeln!(
        w,
        "  issued: total={}, short={}",
        stats.total_ios.iter().sum::<u64>(),
        stats.short_ios.iter().sum::<u64>()
    )?;

    if let Some(ru) = stats.rusage_delta() {
        writeln!(
            w,
            "  cpu: usr={:.2}%, sys={:.2}%, ctx={}, majf={}, minf={}",
            100.0 * ru.user_us as f64 / 1e6 / secs,
            100.0 * ru.sys_us as f64 / 1e6 / secs,
            ru.nvcsw + ru.nivcsw,
            ru.majflt,
            ru.minflt
        )?;
    }

    if stats.errors.count() > 0 {
        writeln!(
            w,
            "  errors: total={}, first: {}",
            stats.errors.count(),
            stats.errors
        )?;
    }

    // Per-worker one-liners when more than one job ran
    if summary.reports.len() > 1 {
        for report in &summary.reports {
            let s = &report.stats;
            writeln!(
                w,
                "  job {}: read={}, write={}, errs={}",
                report.id,
                format_bytes(s.io_bytes[0]),
                format_bytes(s.io_bytes[1] + s.io_bytes[2]),
                s.errors.count()
            )?;
        }
    }

    Ok(())
}

/// Print the summary to stdout.
pub fn print_summary(summary: &RunSummary, opts: &Options) {
    let stdout = io::stdout();
    let _ = write_summary(stdout.lock(), summary, opts);
}

fn stats_json(stats: &JobStats) -> serde_json::Value {
    let lane = |l: usize| {
        json!({
            "ios": if l == 0 { stats.total_ios[0] } else { stats.total_ios[1] },
            "bytes": if l == 0 { stats.io_bytes[0] } else { stats.io_bytes[1] },
            "clat_us": {
                "min": stats.clat[l].min(),
                "max": stats.clat[l].max(),
                "mean": stats.clat[l].mean(),
                "stddev": stats.clat[l].stddev(),
                "samples": stats.clat[l].samples(),
            },
            "bw_bytes_per_sec": {
                "min": stats.bw[l].min(),
                "max": stats.bw[l].max(),
                "mean": stats.bw[l].mean(),
            },
        })
    };
    json!({
        "read": lane(0),
        "write": lane(1),
        "trim": { "ios": stats.total_ios[2], "bytes": stats.io_bytes[2] },
        "depth_map": stats.depth_map,
        "lat_us_dist": stats.lat_u,
        "lat_ms_dist": stats.lat_m,
        "errors": stats.errors.count(),
        "runtime_ms": stats.runtime.as_millis() as u64,
    })
}

/// Machine-readable rendition of the whole run.
pub fn json_summary(summary: &RunSummary) -> serde_json::Value {
    json!({
        "exit_code": summary.exit_code,
        "elapsed_ms": summary.elapsed.as_millis() as u64,
        "aggregate": stats_json(&summary.aggregate),
        "jobs": summary.reports.iter().map(|r| json!({
            "id": r.id,
            "stats": stats_json(&r.stats),
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::EXIT_OK;
    use crate::worker::{RunState, WorkerReport};
    use std::time::Duration;

    fn summary_with_io() -> RunSummary {
        let mut stats = JobStats::new();
        for i in 0..100 {
            stats.record_io(Ddir::Write, 4096, 4096, Some(3), Some(120 + i));
        }
        stats.record_bw_sample(Ddir::Write, 100 << 20);
        stats.record_queue_depth(1);

        RunSummary {
            reports: vec![WorkerReport {
                id: 0,
                state: RunState::Reaped,
                stats: stats.clone(),
            }],
            aggregate: stats,
            elapsed: Duration::from_secs(1),
            exit_code: EXIT_OK,
        }
    }

    #[test]
    fn test_summary_mentions_the_essentials() {
        let summary = summary_with_io();
        let opts = Options::default();

        let mut out = Vec::new();
        write_summary(&mut out, &summary, &opts).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("write:"));
        assert!(text.contains("clat"));
        assert!(text.contains("percentiles"));
        assert!(text.contains("IO depths"));
        assert!(text.contains("issued"));
    }

    #[test]
    fn test_summary_skips_idle_directions() {
        let summary = summary_with_io();
        let opts = Options::default();

        let mut out = Vec::new();
        write_summary(&mut out, &summary, &opts).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("read:"));
    }

    #[test]
    fn test_json_shape() {
        let summary = summary_with_io();
        let value = json_summary(&summary);
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["aggregate"]["write"]["ios"], 100);
        assert_eq!(value["jobs"][0]["id"], 0);
    }
}
