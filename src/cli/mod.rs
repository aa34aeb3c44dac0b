//! Command-line interface for aria-forge.
//!
//! Provides commands for starting and resuming report runs and for listing
//! the capability registry.

mod commands;

pub use commands::{parse_cli, parse_source_spec, run, run_with_cli, Cli, Commands};
