//! Configuration module for Chamber-Sync
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use chamber_sync::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("chamber-sync.toml")).unwrap();
//! println!("Running {} workers", config.worker.count);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, DiscoveryConfig, ListingEntry, RecrawlConfig, RetryConfig, StoreConfig,
    UserAgentConfig, WorkerConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
