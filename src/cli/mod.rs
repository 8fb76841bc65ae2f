//! Command-line interface for matchcast.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
