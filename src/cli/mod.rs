//! Command-line interface for styleforge.
//!
//! Provides commands to run a transformation and to inspect stored tasks.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
