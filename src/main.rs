//! iomill CLI entry point

use clap::Parser;
use iomill::config::cli::Cli;
use iomill::coordinator::{Coordinator, EXIT_CONFIG, EXIT_ERROR};
use iomill::{output, JobError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing_subscriber::EnvFilter;

static TERMINATE: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn sigint_handler(_sig: libc::c_int) {
    if let Some(flag) = TERMINATE.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let opts = match cli.load_options() {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("iomill: {:#}", err);
            return EXIT_CONFIG;
        }
    };

    let coordinator = match Coordinator::new(opts.clone()) {
        Ok(c) => c,
        Err(err @ JobError::ConfigInvalid(_)) => {
            eprintln!("iomill: {}", err);
            return EXIT_CONFIG;
        }
        Err(err) => {
            eprintln!("iomill: {}", err);
            return EXIT_ERROR;
        }
    };

    if cli.dry_run {
        println!("job file ok");
        return 0;
    }

    // Ctrl-C requests a cooperative stop; workers cancel in-flight units
    // and report what they completed.
    let _ = TERMINATE.set(coordinator.terminate_flag());
    let handler = sigint_handler as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }

    let summary = match coordinator.run() {
        Ok(summary) => summary,
        Err(err) => {
            eprintln!("iomill: {:#}", err);
            return EXIT_ERROR;
        }
    };

    output::print_summary(&summary, &opts);
    summary.exit_code
}
