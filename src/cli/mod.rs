//! Command-line interface for fusionn-subs.
//!
//! Provides the worker command plus operator helpers for the model catalog
//! and the job queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
