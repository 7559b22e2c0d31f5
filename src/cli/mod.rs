//! Command-line interface for packamal-scheduler.
//!
//! Provides commands for schema migration, enqueueing analyses, running the
//! worker pool, the periodic maintenance jobs, and queue inspection.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
