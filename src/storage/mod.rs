//! Storage module for persisting sync state and imported records
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - The import status store with compare-and-set transitions
//! - Token-refresh candidates observed during discovery
//! - Idempotent upserts of domain records and their dependent rows
//! - Run tracking

mod schema;
mod sqlite;
mod traits;
mod upsert;

pub use schema::{get_schema_version, NATURAL_KEY_INDEX};
pub use sqlite::SqliteStorage;
pub use traits::{DomainStore, Storage, StorageError, StorageResult};

use crate::entity::Fields;
use crate::state::{FailureKind, ImportStatus};
use crate::SyncError;

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(SyncError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, SyncError> {
    SqliteStorage::new(path)
}

/// Formats a timestamp for storage
///
/// Fixed width with microseconds and a `Z` suffix, so text comparison in SQL
/// orders the same way as time.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Tracking state of one external resource
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRecord {
    pub id: i64,
    pub url: String,
    pub source_page_url: Option<String>,
    pub anchor_text: Option<String>,
    pub url_pattern: String,
    pub family: String,
    pub status: ImportStatus,
    pub recrawl_count: u32,
    pub error_count: u32,
    pub last_error: Option<LastError>,
    pub discovered_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub eligible_at: DateTime<Utc>,
}

/// Most recent failure recorded against an import record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub kind: FailureKind,
    pub message: String,
}

/// A resource found on a listing page, ready to be tracked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImportRecord {
    pub url: String,
    pub source_page_url: Option<String>,
    pub anchor_text: Option<String>,
    pub url_pattern: String,
    pub family: String,
}

/// Result of routing a record through the error transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub status: ImportStatus,
    pub recrawl_count: u32,
    pub error_count: u32,
    /// Set when the record was re-admitted with a backoff
    pub eligible_at: Option<DateTime<Utc>>,
}

/// Represents a sync run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A stored domain record
#[derive(Debug, Clone, PartialEq)]
pub struct DomainRecord {
    pub id: i64,
    pub family: String,
    pub natural_key: String,
    pub fields: Fields,
    pub mapping_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored dependent row
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRecord {
    pub id: i64,
    pub record_id: i64,
    pub parent_id: Option<i64>,
    pub kind: String,
    pub position: u32,
    pub fields: Fields,
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub record_id: i64,
    /// False when an existing record was updated in place
    pub inserted: bool,
    pub children_removed: usize,
    pub children_written: usize,
}

/// What legacy deduplication removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub duplicate_groups: usize,
    pub removed_record_ids: Vec<i64>,
    pub removed_children: usize,
    /// True if this run created the uniqueness constraint
    pub constraint_added: bool,
}
