//! Chamber-Sync: crawl-state tracking and idempotent ingestion for open-data sources
//!
//! This crate keeps a relational store synchronized with a volatile upstream
//! publisher (legislative documents, deputies, budget proposals, ...) whose URLs
//! and access tokens rotate. It decides which resources need (re)fetching,
//! guarantees that concurrent workers never fetch the same resource twice, and
//! writes parsed entity graphs atomically keyed by their natural key.

pub mod config;
pub mod crawler;
pub mod entity;
pub mod mapper;
pub mod output;
pub mod state;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for Chamber-Sync operations
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] mapper::MapError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Domain records contain duplicate natural keys; run with --dedup first")]
    DedupRequired,

    #[error("Worker task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// True when this error only reports a lost claim race
    ///
    /// Losing a claim is the expected outcome for all but one worker and is
    /// never surfaced to the operator.
    pub fn is_already_claimed(&self) -> bool {
        matches!(
            self,
            Self::Storage(storage::StorageError::AlreadyClaimed { .. })
        )
    }

    /// True when this error reports an out-of-order state transition
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            Self::Storage(storage::StorageError::InvalidTransition { .. })
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid mapping descriptor: {0}")]
    InvalidMapping(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host in URL")]
    MissingHost,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for Chamber-Sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use entity::{ChildRow, EntityGraph, NaturalKey};
pub use state::{FailureKind, ImportStatus};
pub use url::{derive_url_pattern, normalize_url, PatternRules};
