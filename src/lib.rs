//! iomill - flexible I/O workload generator and benchmark harness
//!
//! Spawns independent workers, each executing a programmable mix of
//! read/write/trim operations against files or block devices through a
//! pluggable I/O engine, while collecting fine-grained latency, bandwidth
//! and error statistics.
//!
//! # Architecture
//!
//! - **Workers**: one thread per job slot, each owning its files, PRNG
//!   streams, I/O unit pool and stats
//! - **Generators**: direction/size/offset choice, with no-repeat random
//!   maps and zoned addressing
//! - **Engines**: pluggable submit/reap backends behind one trait
//! - **Verification**: seeded or patterned payloads with CRC headers,
//!   inline or offloaded to checker threads
//! - **Stats**: log-linear percentile histograms, depth maps, rate pacing

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod gen;
pub mod output;
pub mod pool;
pub mod rate;
pub mod rng;
pub mod stats;
pub mod target;
pub mod util;
pub mod verify;
pub mod worker;

// Re-export commonly used types
pub use config::Options;
pub use coordinator::Coordinator;
pub use engine::IoEngine;
pub use error::JobError;

/// Result type used throughout iomill
pub type Result<T> = anyhow::Result<T>;
