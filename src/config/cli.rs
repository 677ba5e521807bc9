//! Command line surface
//!
//! Thin layer: a TOML job file plus a handful of common overrides. The
//! option struct itself lives in [`super::Options`]; everything here just
//! loads and patches it.

use super::Options;
use crate::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "iomill", version, about = "Flexible I/O workload generator")]
pub struct Cli {
    /// TOML job file
    pub job_file: PathBuf,

    /// Override the target directory
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Override the run time (milliseconds)
    #[arg(long)]
    pub runtime_ms: Option<u64>,

    /// Override the number of workers
    #[arg(long)]
    pub numjobs: Option<usize>,

    /// Override the I/O engine
    #[arg(long)]
    pub ioengine: Option<String>,

    /// Override the base random seed
    #[arg(long)]
    pub rand_seed: Option<u64>,

    /// Validate the job file and exit
    #[arg(long)]
    pub dry_run: bool,
}

impl Cli {
    /// Load the job file and apply overrides.
    pub fn load_options(&self) -> Result<Options> {
        let mut opts = Options::from_file(&self.job_file)?;

        if let Some(dir) = &self.directory {
            opts.files.directory = dir.clone();
        }
        if let Some(ms) = self.runtime_ms {
            opts.workload.runtime_ms = ms;
        }
        if let Some(n) = self.numjobs {
            opts.depth.numjobs = n;
        }
        if let Some(engine) = &self.ioengine {
            opts.ioengine = engine.clone();
        }
        if let Some(seed) = self.rand_seed {
            opts.workload.rand_seed = seed;
        }

        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_overrides_apply() {
        let mut job = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            job,
            "name = \"t\"\n[files]\nfile_size = 4096\n[workload]\nrw = \"write\""
        )
        .unwrap();

        let cli = Cli::parse_from([
            "iomill",
            job.path().to_str().unwrap(),
            "--numjobs",
            "4",
            "--ioengine",
            "mock",
            "--runtime-ms",
            "250",
        ]);
        let opts = cli.load_options().unwrap();
        assert_eq!(opts.depth.numjobs, 4);
        assert_eq!(opts.ioengine, "mock");
        assert_eq!(opts.workload.runtime_ms, 250);
    }
}
