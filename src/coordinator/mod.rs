//! Supervisor
//!
//! Owns the only cross-worker mutable state: the shared terminate flag, the
//! create-serialization lock, and the report channel. `run` launches one OS
//! thread per job slot, waits, and reaps; `terminate_all` requests a
//! cooperative stop. Workers see none of this directly; they get a
//! [`WorkerHandle`] exposing exactly `is_terminating` and `report`.

use crate::config::{validator, Options};
use crate::error::JobError;
use crate::stats::JobStats;
use crate::worker::{RunState, Worker, WorkerHandle, WorkerReport};
use crate::Result;
use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// All workers finished without error
pub const EXIT_OK: i32 = 0;
/// At least one worker ended with its error slot set
pub const EXIT_ERROR: i32 = 1;
/// The option set was rejected before any worker started
pub const EXIT_CONFIG: i32 = 2;

/// Outcome of a whole run
#[derive(Debug)]
pub struct RunSummary {
    pub reports: Vec<WorkerReport>,
    pub aggregate: JobStats,
    pub elapsed: Duration,
    pub exit_code: i32,
}

/// Spawns, supervises and reaps the worker fleet
pub struct Coordinator {
    opts: Arc<Options>,
    terminate: Arc<AtomicBool>,
}

impl Coordinator {
    /// Validate the options and build a supervisor. A validation failure is
    /// the exit-code-2 path.
    pub fn new(opts: Options) -> std::result::Result<Self, JobError> {
        validator::validate(&opts)?;
        Ok(Self {
            opts: Arc::new(opts),
            terminate: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag every worker to stop at its next loop iteration.
    pub fn terminate_all(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    /// Handle for external stop requests (signal handlers).
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    /// Run the whole job: spawn `numjobs` workers, wait, reap, aggregate.
    pub fn run(&self) -> Result<RunSummary> {
        let numjobs = self.opts.depth.numjobs;
        let (tx, rx) = mpsc::channel::<WorkerReport>();
        let create_lock = self
            .opts
            .files
            .create_serialize
            .then(|| Arc::new(Mutex::new(())));

        info!(jobs = numjobs, name = %self.opts.name, "starting workers");
        let start = Instant::now();

        let mut threads = Vec::with_capacity(numjobs);
        for id in 0..numjobs {
            let handle = WorkerHandle::new(Arc::clone(&self.terminate), tx.clone());
            let worker = Worker::new(id, Arc::clone(&self.opts), handle, create_lock.clone())
                .with_context(|| format!("failed to create worker {}", id))?;

            let thread = std::thread::Builder::new()
                .name(format!("{}-{}", self.opts.name, id))
                .spawn(move || worker.run())
                .with_context(|| format!("failed to spawn worker {}", id))?;
            threads.push(thread);
        }
        drop(tx);

        for thread in threads {
            let _ = thread.join();
        }
        let elapsed = start.elapsed();

        // Every worker has exited; reap the reports.
        let mut reports: Vec<WorkerReport> = rx.iter().collect();
        reports.sort_by_key(|r| r.id);

        let mut aggregate = JobStats::new();
        let mut exit_code = EXIT_OK;
        for report in &mut reports {
            debug_assert_eq!(report.state, RunState::Exited);
            report.state = RunState::Reaped;
            aggregate.merge(&report.stats);
            if report.stats.errors.is_set() {
                error!(
                    worker = report.id,
                    context = report.stats.errors.context(),
                    "worker failed"
                );
                exit_code = EXIT_ERROR;
            }
        }

        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            exit_code, "run complete"
        );
        Ok(RunSummary {
            reports,
            aggregate,
            elapsed,
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RwKind;
    use crate::engine::Ddir;

    fn options(dir: &std::path::Path) -> Options {
        let mut opts = Options::default();
        opts.name = "co".into();
        opts.files.directory = dir.to_path_buf();
        opts.workload.rw = RwKind::Write;
        opts.files.file_size = 64 * 1024;
        opts
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut opts = Options::default();
        opts.depth.iodepth = 0;
        assert!(matches!(
            Coordinator::new(opts),
            Err(JobError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_multi_worker_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.depth.numjobs = 3;

        let summary = Coordinator::new(opts).unwrap().run().unwrap();
        assert_eq!(summary.exit_code, EXIT_OK);
        assert_eq!(summary.reports.len(), 3);
        assert!(summary
            .reports
            .iter()
            .all(|r| r.state == RunState::Reaped));
        // Each worker wrote its own 64 KiB file.
        assert_eq!(
            summary.aggregate.io_bytes[Ddir::Write.index()],
            3 * 64 * 1024
        );
    }

    #[test]
    fn test_worker_error_sets_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        // A minimum rate nothing can satisfy fails the job quickly.
        opts.files.file_size = 16 << 20;
        opts.workload.runtime_ms = 2_000;
        opts.workload.time_based = true;
        opts.rate.ratemin_write = u64::MAX / 2;
        opts.rate.ratecycle_ms = 20;

        let summary = Coordinator::new(opts).unwrap().run().unwrap();
        assert_eq!(summary.exit_code, EXIT_ERROR);
        assert!(summary.aggregate.errors.is_set());
    }

    #[test]
    fn test_terminate_all_stops_timely() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.workload.time_based = true;
        opts.workload.runtime_ms = 30_000;

        let coordinator = Coordinator::new(opts).unwrap();
        let flag = coordinator.terminate_flag();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::Relaxed);
        });

        let start = Instant::now();
        let summary = coordinator.run().unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        // A cooperative stop is not an error.
        assert_eq!(summary.exit_code, EXIT_OK);
    }
}
