//! Per-I/O generators
//!
//! The pieces the worker consults for every I/O it builds: the direction
//! chooser, the block-size splitter, the offset generator, and the random
//! map backing no-repeat random workloads.

pub mod bs;
pub mod ddir;
pub mod offset;
pub mod randmap;
