//! # SweepLib
//!
//! Sweeplib runs an external cache simulator over every combination of trace, cache size and
//! replacement policy, and collects what it reports into a resumable results store
//!
//! The simulator is treated as a black box with a fixed command line: this crate only decides what
//! to run, runs it, and makes sense of what comes back. Results are persisted after every cell, so
//! a sweep can be stopped and picked up again without repeating finished work

/// Stdout artifacts and rebuilding results from them
pub mod artifacts;

/// Contains definitions for the JSON configuration format
pub mod config;

/// Contains the driver which runs a plan against the results stores
pub mod driver;

pub mod error;

/// Turns captured simulator output into results
pub mod extract;

/// Handling of SIGINT and SIGTERM during a sweep
pub mod interrupt;

/// Builds simulator command lines and runs them
pub mod invoke;

/// Reading of simulator output artifacts
pub mod io;

/// Contains the sweep plan, the cells to run
pub mod plan;

/// Contains the persistent results store
pub mod store;

/// Trace discovery
pub mod traces;

#[cfg(test)]
mod test;

/// Contains utilities for running tests and benchmarks.
pub mod util;

pub use error::{Result, SweepError};
