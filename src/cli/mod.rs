//! Command-line interface for notify-queue.
//!
//! Provides the worker runner and the queue administration commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
