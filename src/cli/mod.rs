//! Command-line interface for firefleet.
//!
//! Provides commands for running requests, sweeping orphaned instances and
//! documenting the configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
