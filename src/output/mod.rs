//! Output module for operator-facing reports
//!
//! This module handles:
//! - Collecting import status and domain record statistics
//! - Printing them for the `--stats` command

pub mod stats;

pub use stats::{load_statistics, print_statistics, SyncStatistics};
