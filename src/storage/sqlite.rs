//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.
//! Each worker opens its own `SqliteStorage` on the same database file; the
//! compare-and-set updates below are what keep them from stepping on each
//! other.

use crate::state::{Failure, FailureKind, ImportStatus, Resolution, RetryPolicy};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    format_timestamp, parse_timestamp, FailureOutcome, ImportRecord, LastError, NewImportRecord,
    RunRecord, RunStatus,
};
use crate::SyncError;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// How long a connection waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const IMPORT_COLUMNS: &str = "id, url, source_page_url, anchor_text, url_pattern, family, status, \
     recrawl_count, error_count, last_error_kind, last_error_message, \
     discovered_at, claimed_at, updated_at, eligible_at";

/// SQLite storage backend
pub struct SqliteStorage {
    pub(super) conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(SyncError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        Self::with_connection(conn)
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, SyncError> {
        if !initialize_schema(&conn)? {
            tracing::warn!(
                "Domain records contain duplicate natural keys; upserts are disabled until deduplication runs (--dedup)"
            );
        }
        Ok(Self { conn })
    }

    fn query_records<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> StorageResult<Vec<ImportRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt
            .query_map(params, row_to_import_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Explains why a conditional update matched no row
    fn diagnose_transition(&self, id: i64, to: ImportStatus) -> StorageError {
        match self.get_import_record(id) {
            Ok(record) if to == ImportStatus::Claimed && record.status.is_in_flight() => {
                StorageError::AlreadyClaimed { url: record.url }
            }
            Ok(record) if to == ImportStatus::Claimed && record.status == ImportStatus::Discovered => {
                StorageError::NotYetEligible {
                    url: record.url,
                    eligible_at: record.eligible_at,
                }
            }
            Ok(record) => StorageError::InvalidTransition {
                url: record.url,
                from: record.status,
                to,
            },
            Err(e) => e,
        }
    }

    /// Like `diagnose_transition`, for updates made on behalf of one claim
    ///
    /// A record that is in flight under a different `claimed_at` was swept and
    /// claimed again; the caller's claim is gone.
    fn diagnose_claimed(&self, id: i64, claimed_at: &str, to: ImportStatus) -> StorageError {
        match self.get_import_record(id) {
            Ok(record)
                if record.status.is_in_flight()
                    && record.claimed_at.map(|c| format_timestamp(&c)).as_deref()
                        != Some(claimed_at) =>
            {
                StorageError::AlreadyClaimed { url: record.url }
            }
            Ok(_) => self.diagnose_transition(id, to),
            Err(e) => e,
        }
    }
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        let now = format_timestamp(&Utc::now());
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, config_hash, status FROM runs ORDER BY id DESC LIMIT 1",
        )?;

        let run = stmt
            .query_row([], |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    config_hash: row.get(3)?,
                    status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
                        .unwrap_or(RunStatus::Running),
                })
            })
            .optional()?;

        Ok(run)
    }

    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let now = format_timestamp(&Utc::now());
        self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), now, run_id],
        )?;
        Ok(())
    }

    // ===== Import Records =====

    fn register_discovered(
        &mut self,
        record: &NewImportRecord,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<i64>> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO import_records
                (url, source_page_url, anchor_text, url_pattern, family, status,
                 discovered_at, updated_at, eligible_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?7)",
            params![
                record.url,
                record.source_page_url,
                record.anchor_text,
                record.url_pattern,
                record.family,
                ImportStatus::Discovered.to_db_string(),
                format_timestamp(&now),
            ],
        )?;

        if changed == 0 {
            Ok(None)
        } else {
            Ok(Some(self.conn.last_insert_rowid()))
        }
    }

    fn get_import_record(&self, id: i64) -> StorageResult<ImportRecord> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM import_records WHERE id = ?1", IMPORT_COLUMNS),
                params![id],
                row_to_import_record,
            )
            .optional()?
            .ok_or_else(|| StorageError::RecordNotFound(format!("id {}", id)))
    }

    fn get_import_record_by_url(&self, url: &str) -> StorageResult<Option<ImportRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {} FROM import_records WHERE url = ?1", IMPORT_COLUMNS),
                params![url],
                row_to_import_record,
            )
            .optional()?;
        Ok(record)
    }

    fn find_by_pattern(
        &self,
        url_pattern: &str,
        anchor_text: Option<&str>,
    ) -> StorageResult<Vec<ImportRecord>> {
        // `IS` so that a missing anchor matches a missing anchor
        self.query_records(
            &format!(
                "SELECT {} FROM import_records
                 WHERE url_pattern = ?1 AND anchor_text IS ?2
                 ORDER BY updated_at DESC, id DESC",
                IMPORT_COLUMNS
            ),
            params![url_pattern, anchor_text],
        )
    }

    fn get_records_by_status(&self, status: ImportStatus) -> StorageResult<Vec<ImportRecord>> {
        self.query_records(
            &format!(
                "SELECT {} FROM import_records WHERE status = ?1 ORDER BY id",
                IMPORT_COLUMNS
            ),
            params![status.to_db_string()],
        )
    }

    fn count_by_status(&self, status: ImportStatus) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM import_records WHERE status = ?1",
            params![status.to_db_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_import_records(&self) -> StorageResult<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM import_records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ===== State Transitions =====

    fn list_claimable(&self, now: DateTime<Utc>, limit: u32) -> StorageResult<Vec<ImportRecord>> {
        self.query_records(
            &format!(
                "SELECT {} FROM import_records
                 WHERE status = ?1 AND eligible_at <= ?2
                 ORDER BY eligible_at, id
                 LIMIT ?3",
                IMPORT_COLUMNS
            ),
            params![
                ImportStatus::Discovered.to_db_string(),
                format_timestamp(&now),
                limit
            ],
        )
    }

    fn claim(&mut self, id: i64, now: DateTime<Utc>) -> StorageResult<ImportRecord> {
        let changed = self.conn.execute(
            "UPDATE import_records SET status = ?1, claimed_at = ?2, updated_at = ?2
             WHERE id = ?3 AND status = ?4 AND eligible_at <= ?2",
            params![
                ImportStatus::Claimed.to_db_string(),
                format_timestamp(&now),
                id,
                ImportStatus::Discovered.to_db_string()
            ],
        )?;

        if changed == 0 {
            return Err(self.diagnose_transition(id, ImportStatus::Claimed));
        }
        self.get_import_record(id)
    }

    fn mark_fetched(
        &mut self,
        id: i64,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let claim = format_timestamp(&claimed_at);
        let changed = self.conn.execute(
            "UPDATE import_records SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status = ?4 AND claimed_at = ?5",
            params![
                ImportStatus::Fetched.to_db_string(),
                format_timestamp(&now),
                id,
                ImportStatus::Claimed.to_db_string(),
                claim
            ],
        )?;

        if changed == 0 {
            return Err(self.diagnose_claimed(id, &claim, ImportStatus::Fetched));
        }
        Ok(())
    }

    fn mark_imported(
        &mut self,
        id: i64,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let ts = format_timestamp(&now);
        let claim = format_timestamp(&claimed_at);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE import_records
             SET status = ?1, updated_at = ?2, last_error_kind = NULL, last_error_message = NULL
             WHERE id = ?3 AND status = ?4 AND claimed_at = ?5",
            params![
                ImportStatus::Imported.to_db_string(),
                ts,
                id,
                ImportStatus::Fetched.to_db_string(),
                claim
            ],
        )?;

        if changed == 0 {
            drop(tx);
            return Err(self.diagnose_claimed(id, &claim, ImportStatus::Imported));
        }

        // Refreshes seen after the claim may point at a newer token than the
        // one just fetched; they stay pending for the scheduler.
        tx.execute(
            "UPDATE token_refreshes SET consumed_at = ?1
             WHERE import_record_id = ?2
               AND consumed_at IS NULL
               AND observed_at <= (SELECT claimed_at FROM import_records WHERE id = ?2)",
            params![ts, id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn record_failure(
        &mut self,
        id: i64,
        claimed_at: DateTime<Utc>,
        failure: &Failure,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> StorageResult<FailureOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = tx
            .query_row(
                &format!("SELECT {} FROM import_records WHERE id = ?1", IMPORT_COLUMNS),
                params![id],
                row_to_import_record,
            )
            .optional()?
            .ok_or_else(|| StorageError::RecordNotFound(format!("id {}", id)))?;

        if !record.status.is_in_flight() {
            return Err(StorageError::InvalidTransition {
                url: record.url,
                from: record.status,
                to: ImportStatus::Error,
            });
        }

        let claim = format_timestamp(&claimed_at);
        if record.claimed_at.map(|c| format_timestamp(&c)).as_deref() != Some(claim.as_str()) {
            return Err(StorageError::AlreadyClaimed { url: record.url });
        }

        let previous = record.last_error.as_ref().map(|e| e.kind);
        let error_count = record.error_count.saturating_add(1);

        let (status, recrawl_count, eligible_at) =
            match policy.resolve(failure.kind, record.recrawl_count, previous) {
                Resolution::Retry {
                    recrawl_count,
                    delay,
                } => (
                    ImportStatus::Discovered,
                    recrawl_count,
                    Some(add_delay(now, delay)),
                ),
                Resolution::Abandon => (ImportStatus::Abandoned, record.recrawl_count, None),
                Resolution::Park => (ImportStatus::Error, record.recrawl_count, None),
            };

        let changed = tx.execute(
            "UPDATE import_records
             SET status = ?1, recrawl_count = ?2, error_count = ?3,
                 last_error_kind = ?4, last_error_message = ?5,
                 claimed_at = NULL, updated_at = ?6, eligible_at = ?7
             WHERE id = ?8 AND status = ?9 AND claimed_at = ?10",
            params![
                status.to_db_string(),
                recrawl_count,
                error_count,
                failure.kind.to_db_string(),
                failure.message,
                format_timestamp(&now),
                format_timestamp(&eligible_at.unwrap_or(record.eligible_at)),
                id,
                record.status.to_db_string(),
                claim
            ],
        )?;

        if changed == 0 {
            return Err(StorageError::Database(format!(
                "record {} changed status during failure handling",
                record.url
            )));
        }

        tx.commit()?;

        Ok(FailureOutcome {
            status,
            recrawl_count,
            error_count,
            eligible_at,
        })
    }

    fn readmit_token_refresh(&mut self, id: i64, now: DateTime<Utc>) -> StorageResult<()> {
        let ts = format_timestamp(&now);
        let changed = self.conn.execute(
            "UPDATE import_records
             SET status = ?1, claimed_at = NULL, updated_at = ?2, eligible_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![
                ImportStatus::Discovered.to_db_string(),
                ts,
                id,
                ImportStatus::Imported.to_db_string()
            ],
        )?;

        if changed == 0 {
            return Err(self.diagnose_transition(id, ImportStatus::Discovered));
        }
        Ok(())
    }

    fn reset_for_operator(
        &mut self,
        url: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<ImportRecord> {
        let ts = format_timestamp(&now);
        let changed = self.conn.execute(
            "UPDATE import_records
             SET status = ?1, recrawl_count = 0, claimed_at = NULL, updated_at = ?2, eligible_at = ?2
             WHERE url = ?3 AND status IN (?4, ?5)",
            params![
                ImportStatus::Discovered.to_db_string(),
                ts,
                url,
                ImportStatus::Abandoned.to_db_string(),
                ImportStatus::Error.to_db_string()
            ],
        )?;

        let record = self
            .get_import_record_by_url(url)?
            .ok_or_else(|| StorageError::RecordNotFound(url.to_string()))?;

        if changed == 0 {
            return Err(StorageError::InvalidTransition {
                url: record.url,
                from: record.status,
                to: ImportStatus::Discovered,
            });
        }
        Ok(record)
    }

    fn list_stale_claims(&self, claimed_before: DateTime<Utc>) -> StorageResult<Vec<ImportRecord>> {
        self.query_records(
            &format!(
                "SELECT {} FROM import_records
                 WHERE status IN (?1, ?2) AND claimed_at < ?3
                 ORDER BY claimed_at, id",
                IMPORT_COLUMNS
            ),
            params![
                ImportStatus::Claimed.to_db_string(),
                ImportStatus::Fetched.to_db_string(),
                format_timestamp(&claimed_before)
            ],
        )
    }

    // ===== Token Refreshes =====

    fn record_token_refresh(
        &mut self,
        import_record_id: i64,
        fresh_url: &str,
        source_page_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "INSERT INTO token_refreshes (import_record_id, fresh_url, source_page_url, observed_at)
             SELECT ?1, ?2, ?3, ?4
             WHERE NOT EXISTS (
                 SELECT 1 FROM token_refreshes
                 WHERE import_record_id = ?1 AND fresh_url = ?2
             )",
            params![
                import_record_id,
                fresh_url,
                source_page_url,
                format_timestamp(&now)
            ],
        )?;
        Ok(changed > 0)
    }

    fn list_pending_token_refreshes(&self) -> StorageResult<Vec<ImportRecord>> {
        self.query_records(
            &format!(
                "SELECT {} FROM import_records r
                 WHERE r.status = ?1
                   AND EXISTS (
                       SELECT 1 FROM token_refreshes t
                       WHERE t.import_record_id = r.id AND t.consumed_at IS NULL
                   )
                 ORDER BY r.id",
                IMPORT_COLUMNS
            ),
            params![ImportStatus::Imported.to_db_string()],
        )
    }

    fn fetch_url_for(&self, id: i64) -> StorageResult<String> {
        let fresh: Option<String> = self
            .conn
            .query_row(
                "SELECT fresh_url FROM token_refreshes
                 WHERE import_record_id = ?1
                 ORDER BY observed_at DESC, id DESC
                 LIMIT 1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match fresh {
            Some(url) => Ok(url),
            None => Ok(self.get_import_record(id)?.url),
        }
    }
}

fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or_else(|| now + chrono::Duration::days(365))
}

fn invalid_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        parse_timestamp(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn row_to_import_record(row: &Row<'_>) -> rusqlite::Result<ImportRecord> {
    let status_raw: String = row.get(6)?;
    let status = ImportStatus::from_db_string(&status_raw)
        .ok_or_else(|| invalid_column(6, format!("unknown import status '{}'", status_raw)))?;

    let last_error = match row.get::<_, Option<String>>(9)? {
        Some(kind_raw) => {
            let kind = FailureKind::from_db_string(&kind_raw)
                .ok_or_else(|| invalid_column(9, format!("unknown failure kind '{}'", kind_raw)))?;
            Some(LastError {
                kind,
                message: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            })
        }
        None => None,
    };

    Ok(ImportRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        source_page_url: row.get(2)?,
        anchor_text: row.get(3)?,
        url_pattern: row.get(4)?,
        family: row.get(5)?,
        status,
        recrawl_count: row.get(7)?,
        error_count: row.get(8)?,
        last_error,
        discovered_at: timestamp_column(row, 11)?,
        claimed_at: optional_timestamp_column(row, 12)?,
        updated_at: timestamp_column(row, 13)?,
        eligible_at: timestamp_column(row, 14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BackoffPolicy;

    fn t0() -> DateTime<Utc> {
        parse_timestamp("2026-03-02T08:00:00Z").unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn new_record(url: &str, anchor: &str) -> NewImportRecord {
        NewImportRecord {
            url: url.to_string(),
            source_page_url: Some("https://example.org/listing".to_string()),
            anchor_text: Some(anchor.to_string()),
            url_pattern: "https://example.org/doc?id=1&tk={token}".to_string(),
            family: "budget_proposal".to_string(),
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            BackoffPolicy::new(Duration::from_secs(60), 2, Duration::from_secs(3600)),
        )
    }

    fn storage_with_record() -> (SqliteStorage, i64) {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let id = storage
            .register_discovered(&new_record("https://example.org/doc?id=1&tk=a", "Proposal 1"), t0())
            .unwrap()
            .unwrap();
        (storage, id)
    }

    fn claim_and_fetch(storage: &mut SqliteStorage, id: i64, now: DateTime<Utc>) {
        storage.claim(id, now).unwrap();
        storage.mark_fetched(id, now, now).unwrap();
    }

    #[test]
    fn test_create_in_memory() {
        let storage = SqliteStorage::new_in_memory();
        assert!(storage.is_ok());
    }

    #[test]
    fn test_create_and_finish_run() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run_id = storage.create_run("abc123").unwrap();
        assert!(run_id > 0);

        storage.finish_run(run_id, RunStatus::Completed).unwrap();
        let run = storage.get_latest_run().unwrap().unwrap();
        assert_eq!(run.id, run_id);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_register_is_insert_only() {
        let (mut storage, id) = storage_with_record();
        claim_and_fetch(&mut storage, id, t0());

        let again = storage
            .register_discovered(&new_record("https://example.org/doc?id=1&tk=a", "Proposal 1"), t0())
            .unwrap();
        assert_eq!(again, None);

        let record = storage.get_import_record(id).unwrap();
        assert_eq!(record.status, ImportStatus::Fetched);
        assert_eq!(storage.count_import_records().unwrap(), 1);
    }

    #[test]
    fn test_new_record_defaults() {
        let (storage, id) = storage_with_record();
        let record = storage.get_import_record(id).unwrap();

        assert_eq!(record.status, ImportStatus::Discovered);
        assert_eq!(record.recrawl_count, 0);
        assert_eq!(record.error_count, 0);
        assert_eq!(record.last_error, None);
        assert_eq!(record.claimed_at, None);
        assert_eq!(record.discovered_at, t0());
        assert_eq!(record.eligible_at, t0());
    }

    #[test]
    fn test_second_claim_loses() {
        let (mut storage, id) = storage_with_record();

        let claimed = storage.claim(id, t0()).unwrap();
        assert_eq!(claimed.status, ImportStatus::Claimed);
        assert_eq!(claimed.claimed_at, Some(t0()));

        let second = storage.claim(id, t0());
        assert!(matches!(second, Err(StorageError::AlreadyClaimed { .. })));
    }

    #[test]
    fn test_claim_waits_for_backoff() {
        let (mut storage, id) = storage_with_record();
        claim_and_fetch(&mut storage, id, t0());
        storage
            .record_failure(id, t0(), &Failure::transient("HTTP 502"), &policy(5), t0())
            .unwrap();

        assert!(matches!(
            storage.claim(id, t0() + secs(10)),
            Err(StorageError::NotYetEligible { .. })
        ));
        assert!(storage.claim(id, t0() + secs(60)).is_ok());
    }

    #[test]
    fn test_out_of_order_transition_rejected() {
        let (mut storage, id) = storage_with_record();

        let result = storage.mark_imported(id, t0(), t0());
        assert!(matches!(
            result,
            Err(StorageError::InvalidTransition {
                from: ImportStatus::Discovered,
                to: ImportStatus::Imported,
                ..
            })
        ));

        let result = storage.mark_fetched(id, t0(), t0());
        assert!(matches!(
            result,
            Err(StorageError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unknown_record() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        assert!(matches!(
            storage.claim(999, t0()),
            Err(StorageError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_full_lifecycle() {
        let (mut storage, id) = storage_with_record();

        claim_and_fetch(&mut storage, id, t0());
        storage.mark_imported(id, t0(), t0() + secs(1)).unwrap();

        let record = storage.get_import_record(id).unwrap();
        assert_eq!(record.status, ImportStatus::Imported);
        assert_eq!(record.updated_at, t0() + secs(1));
        assert_eq!(storage.count_by_status(ImportStatus::Imported).unwrap(), 1);
    }

    #[test]
    fn test_list_claimable_respects_backoff() {
        let (mut storage, id) = storage_with_record();
        assert_eq!(storage.list_claimable(t0(), 10).unwrap().len(), 1);

        claim_and_fetch(&mut storage, id, t0());
        let outcome = storage
            .record_failure(id, t0(), &Failure::transient("HTTP 503"), &policy(5), t0())
            .unwrap();
        assert_eq!(outcome.status, ImportStatus::Discovered);
        assert_eq!(outcome.eligible_at, Some(t0() + secs(60)));

        assert!(storage.list_claimable(t0() + secs(59), 10).unwrap().is_empty());
        assert_eq!(storage.list_claimable(t0() + secs(60), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_transient_failures_abandon_at_max_retries() {
        let (mut storage, id) = storage_with_record();
        let policy = policy(3);
        let mut now = t0();

        for expected in 1..3u32 {
            claim_and_fetch(&mut storage, id, now);
            let outcome = storage
                .record_failure(id, now, &Failure::transient("timeout"), &policy, now)
                .unwrap();
            assert_eq!(outcome.status, ImportStatus::Discovered);
            assert_eq!(outcome.recrawl_count, expected);
            assert_eq!(outcome.error_count, expected);
            now = now + secs(7200);
        }

        claim_and_fetch(&mut storage, id, now);
        let outcome = storage
            .record_failure(id, now, &Failure::transient("timeout"), &policy, now)
            .unwrap();
        assert_eq!(outcome.status, ImportStatus::Abandoned);
        assert_eq!(outcome.error_count, 3);

        let record = storage.get_import_record(id).unwrap();
        assert_eq!(
            record.last_error,
            Some(LastError {
                kind: FailureKind::Transient,
                message: "timeout".to_string()
            })
        );
        assert!(storage.list_claimable(now + secs(100_000), 10).unwrap().is_empty());
    }

    #[test]
    fn test_schema_drift_parks_without_budget() {
        let (mut storage, id) = storage_with_record();
        claim_and_fetch(&mut storage, id, t0());

        let outcome = storage
            .record_failure(id, t0(), &Failure::schema_drift("unmapped field 'annex'"), &policy(5), t0())
            .unwrap();
        assert_eq!(outcome.status, ImportStatus::Error);
        assert_eq!(outcome.recrawl_count, 0);
        assert_eq!(outcome.error_count, 1);
        assert!(storage.list_claimable(t0() + secs(100_000), 10).unwrap().is_empty());
    }

    #[test]
    fn test_permanent_failure_retried_once() {
        let (mut storage, id) = storage_with_record();

        claim_and_fetch(&mut storage, id, t0());
        let first = storage
            .record_failure(id, t0(), &Failure::permanent("HTTP 404"), &policy(5), t0())
            .unwrap();
        assert_eq!(first.status, ImportStatus::Discovered);

        storage.claim(id, t0() + secs(60)).unwrap();
        let second = storage
            .record_failure(id, t0() + secs(60), &Failure::permanent("HTTP 404"), &policy(5), t0() + secs(60))
            .unwrap();
        assert_eq!(second.status, ImportStatus::Abandoned);
    }

    #[test]
    fn test_failure_requires_in_flight_record() {
        let (mut storage, id) = storage_with_record();
        let result = storage.record_failure(id, t0(), &Failure::transient("x"), &policy(5), t0());
        assert!(matches!(
            result,
            Err(StorageError::InvalidTransition {
                from: ImportStatus::Discovered,
                to: ImportStatus::Error,
                ..
            })
        ));
    }

    #[test]
    fn test_operator_reset() {
        let (mut storage, id) = storage_with_record();
        let url = "https://example.org/doc?id=1&tk=a";

        assert!(matches!(
            storage.reset_for_operator(url, t0()),
            Err(StorageError::InvalidTransition { .. })
        ));

        claim_and_fetch(&mut storage, id, t0());
        storage
            .record_failure(id, t0(), &Failure::transient("x"), &policy(1), t0())
            .unwrap();
        assert_eq!(
            storage.get_import_record(id).unwrap().status,
            ImportStatus::Abandoned
        );

        let record = storage.reset_for_operator(url, t0() + secs(5)).unwrap();
        assert_eq!(record.status, ImportStatus::Discovered);
        assert_eq!(record.recrawl_count, 0);
        assert_eq!(record.error_count, 1);
        assert_eq!(storage.list_claimable(t0() + secs(5), 10).unwrap().len(), 1);

        assert!(matches!(
            storage.reset_for_operator("https://example.org/missing", t0()),
            Err(StorageError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_stale_claims() {
        let (mut storage, id) = storage_with_record();
        storage.claim(id, t0()).unwrap();

        assert!(storage.list_stale_claims(t0()).unwrap().is_empty());
        let stale = storage.list_stale_claims(t0() + secs(1)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, id);
    }

    #[test]
    fn test_find_by_pattern_matches_anchor() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        storage
            .register_discovered(&new_record("https://example.org/doc?id=1&tk=a", "Proposal 1"), t0())
            .unwrap();
        storage
            .register_discovered(&new_record("https://example.org/doc?id=1&tk=b", "Proposal 2"), t0())
            .unwrap();

        let pattern = "https://example.org/doc?id=1&tk={token}";
        let matches = storage.find_by_pattern(pattern, Some("Proposal 1")).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].url, "https://example.org/doc?id=1&tk=a");

        assert!(storage.find_by_pattern(pattern, None).unwrap().is_empty());
    }

    #[test]
    fn test_token_refresh_cycle() {
        let (mut storage, id) = storage_with_record();
        claim_and_fetch(&mut storage, id, t0());
        storage.mark_imported(id, t0(), t0()).unwrap();

        assert_eq!(
            storage.fetch_url_for(id).unwrap(),
            "https://example.org/doc?id=1&tk=a"
        );

        let fresh = "https://example.org/doc?id=1&tk=b";
        assert!(storage
            .record_token_refresh(id, fresh, None, t0() + secs(10))
            .unwrap());
        assert!(!storage
            .record_token_refresh(id, fresh, None, t0() + secs(11))
            .unwrap());

        let pending = storage.list_pending_token_refreshes().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(storage.fetch_url_for(id).unwrap(), fresh);

        storage.readmit_token_refresh(id, t0() + secs(20)).unwrap();
        let record = storage.get_import_record(id).unwrap();
        assert_eq!(record.status, ImportStatus::Discovered);
        assert_eq!(record.recrawl_count, 0);
        assert!(storage.list_pending_token_refreshes().unwrap().is_empty());

        claim_and_fetch(&mut storage, id, t0() + secs(30));
        storage.mark_imported(id, t0() + secs(30), t0() + secs(31)).unwrap();
        assert!(storage.list_pending_token_refreshes().unwrap().is_empty());
        assert_eq!(storage.fetch_url_for(id).unwrap(), fresh);
    }

    #[test]
    fn test_refresh_seen_during_fetch_stays_pending() {
        let (mut storage, id) = storage_with_record();
        storage.claim(id, t0()).unwrap();

        storage
            .record_token_refresh(id, "https://example.org/doc?id=1&tk=late", None, t0() + secs(1))
            .unwrap();

        storage.mark_fetched(id, t0(), t0() + secs(2)).unwrap();
        storage.mark_imported(id, t0(), t0() + secs(3)).unwrap();

        let pending = storage.list_pending_token_refreshes().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
    }

    #[test]
    fn test_swept_claim_cannot_advance_replacement() {
        let (mut storage, id) = storage_with_record();
        let first = storage.claim(id, t0()).unwrap().claimed_at.unwrap();

        // Swept after the claim timeout, then picked up by another worker
        storage
            .record_failure(id, first, &Failure::transient("claim expired"), &policy(5), t0() + secs(601))
            .unwrap();
        let second = storage
            .claim(id, t0() + secs(700))
            .unwrap()
            .claimed_at
            .unwrap();
        assert_ne!(first, second);

        assert!(matches!(
            storage.mark_fetched(id, first, t0() + secs(710)),
            Err(StorageError::AlreadyClaimed { .. })
        ));
        assert!(matches!(
            storage.record_failure(id, first, &Failure::transient("timeout"), &policy(5), t0() + secs(710)),
            Err(StorageError::AlreadyClaimed { .. })
        ));
        let record = storage.get_import_record(id).unwrap();
        assert_eq!(record.status, ImportStatus::Claimed);
        assert_eq!(record.claimed_at, Some(second));
        assert_eq!(record.error_count, 1);

        storage.mark_fetched(id, second, t0() + secs(720)).unwrap();
        assert!(matches!(
            storage.mark_imported(id, first, t0() + secs(730)),
            Err(StorageError::AlreadyClaimed { .. })
        ));
        storage.mark_imported(id, second, t0() + secs(730)).unwrap();
        assert_eq!(
            storage.get_import_record(id).unwrap().status,
            ImportStatus::Imported
        );
    }

    #[test]
    fn test_readmit_requires_imported() {
        let (mut storage, id) = storage_with_record();
        assert!(matches!(
            storage.readmit_token_refresh(id, t0()),
            Err(StorageError::InvalidTransition { .. })
        ));
    }
}
