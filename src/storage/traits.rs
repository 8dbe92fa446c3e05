//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::entity::{EntityGraph, NaturalKey};
use crate::state::{Failure, ImportStatus, RetryPolicy};
use crate::storage::{
    ChildRecord, DedupReport, DomainRecord, FailureOutcome, ImportRecord, NewImportRecord,
    RunRecord, RunStatus, UpsertOutcome,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Import record not found: {0}")]
    RecordNotFound(String),

    #[error("Already claimed by another worker: {url}")]
    AlreadyClaimed { url: String },

    #[error("Not claimable before {eligible_at}: {url}")]
    NotYetEligible {
        url: String,
        eligible_at: DateTime<Utc>,
    },

    #[error("Invalid state transition for {url}: {from:?} -> {to:?}")]
    InvalidTransition {
        url: String,
        from: ImportStatus,
        to: ImportStatus,
    },

    #[error("No natural-key uniqueness constraint on domain records (family {family}); run deduplication first")]
    MissingNaturalKeyConstraint { family: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Import Status Store operations
///
/// Every state change is a conditional update keyed by record id and expected
/// status; a change that matches no row is diagnosed as `AlreadyClaimed`,
/// `InvalidTransition` or `RecordNotFound`. Implementations never hold a lock
/// across calls.
pub trait Storage {
    // ===== Run Management =====

    /// Creates a new sync run
    ///
    /// # Arguments
    ///
    /// * `config_hash` - Hash of the configuration file
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Marks a run as finished with the given status
    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    // ===== Import Records =====

    /// Inserts a newly discovered resource
    ///
    /// Returns the new record ID, or `None` if the URL is already tracked.
    /// Existing records are never modified.
    fn register_discovered(
        &mut self,
        record: &NewImportRecord,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<i64>>;

    /// Gets a record by ID
    fn get_import_record(&self, id: i64) -> StorageResult<ImportRecord>;

    /// Gets a record by its exact (normalized) URL
    fn get_import_record_by_url(&self, url: &str) -> StorageResult<Option<ImportRecord>>;

    /// Gets records sharing a URL pattern and anchor text, most recently updated first
    fn find_by_pattern(
        &self,
        url_pattern: &str,
        anchor_text: Option<&str>,
    ) -> StorageResult<Vec<ImportRecord>>;

    /// Gets all records in a specific status
    fn get_records_by_status(&self, status: ImportStatus) -> StorageResult<Vec<ImportRecord>>;

    /// Counts records in a specific status
    fn count_by_status(&self, status: ImportStatus) -> StorageResult<u64>;

    /// Counts all tracked records
    fn count_import_records(&self) -> StorageResult<u64>;

    // ===== State Transitions =====

    /// Lists `Discovered` records whose backoff has elapsed, oldest first
    fn list_claimable(&self, now: DateTime<Utc>, limit: u32) -> StorageResult<Vec<ImportRecord>>;

    /// Atomically claims a `Discovered` record (compare-and-set)
    ///
    /// Fails with `AlreadyClaimed` if another worker won the race, and with
    /// `NotYetEligible` while the record is still backing off.
    fn claim(&mut self, id: i64, now: DateTime<Utc>) -> StorageResult<ImportRecord>;

    /// `Claimed -> Fetched` for the claim taken at `claimed_at`
    ///
    /// The in-flight transitions below only apply to the claim identified by
    /// `claimed_at`. Once a claim has been swept and the record claimed again,
    /// the previous holder gets `AlreadyClaimed`.
    fn mark_fetched(
        &mut self,
        id: i64,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// `Fetched -> Imported`; consumes token refreshes seen before the claim
    fn mark_imported(
        &mut self,
        id: i64,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Routes a `Claimed`/`Fetched` record through the error transition
    ///
    /// Increments `error_count`, records the failure, and resolves the record
    /// to `Discovered` (retry), `Abandoned` or `Error` (parked) per the policy,
    /// all in one transaction.
    fn record_failure(
        &mut self,
        id: i64,
        claimed_at: DateTime<Utc>,
        failure: &Failure,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> StorageResult<FailureOutcome>;

    /// `Imported -> Discovered` for a token refresh; `recrawl_count` unchanged
    fn readmit_token_refresh(&mut self, id: i64, now: DateTime<Utc>) -> StorageResult<()>;

    /// Operator re-admission of an `Abandoned` or `Error` record
    ///
    /// Resets `recrawl_count` to zero.
    fn reset_for_operator(&mut self, url: &str, now: DateTime<Utc>)
        -> StorageResult<ImportRecord>;

    /// Gets `Claimed`/`Fetched` records claimed before the given instant
    fn list_stale_claims(&self, claimed_before: DateTime<Utc>) -> StorageResult<Vec<ImportRecord>>;

    // ===== Token Refreshes =====

    /// Records that a tracked document was observed under a new URL
    ///
    /// Returns false if the same URL was already recorded for the record, so
    /// re-scanning a listing never re-admits a document twice for one token.
    fn record_token_refresh(
        &mut self,
        import_record_id: i64,
        fresh_url: &str,
        source_page_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Gets `Imported` records with unconsumed token refreshes
    fn list_pending_token_refreshes(&self) -> StorageResult<Vec<ImportRecord>>;

    /// The URL a worker should fetch for a record: the freshest observed one
    fn fetch_url_for(&self, id: i64) -> StorageResult<String>;
}

/// Upsert Writer operations over domain records
pub trait DomainStore {
    /// Whether the natural-key uniqueness constraint is in place
    fn has_natural_key_constraint(&self) -> StorageResult<bool>;

    /// Inserts or updates a record by natural key and replaces its children
    ///
    /// The whole graph lands in one transaction or not at all.
    fn upsert_entity(
        &mut self,
        graph: &EntityGraph,
        now: DateTime<Utc>,
    ) -> StorageResult<UpsertOutcome>;

    /// Gets a record by family and natural key
    fn get_domain_record(
        &self,
        family: &str,
        natural_key: &NaturalKey,
    ) -> StorageResult<Option<DomainRecord>>;

    /// Gets every child row owned by a record, in insertion order
    fn get_children(&self, record_id: i64) -> StorageResult<Vec<ChildRecord>>;

    /// Counts records per family
    fn count_domain_records(&self) -> StorageResult<Vec<(String, u64)>>;

    /// One-time cleanup of legacy duplicates, then adds the uniqueness constraint
    ///
    /// Keeps the lowest id of each `(family, natural_key)` group and deletes
    /// the others together with their children.
    fn dedup_domain_records(&mut self) -> StorageResult<DedupReport>;
}
