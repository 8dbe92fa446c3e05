//! Database schema definitions and migrations
//!
//! This module contains all SQL schema definitions for the Chamber-Sync database.

use rusqlite::Connection;

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track sync runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL
);

-- One row per tracked external resource
CREATE TABLE IF NOT EXISTS import_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    source_page_url TEXT,
    anchor_text TEXT,
    url_pattern TEXT NOT NULL,
    family TEXT NOT NULL,
    status TEXT NOT NULL,
    recrawl_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error_kind TEXT,
    last_error_message TEXT,
    discovered_at TEXT NOT NULL,
    claimed_at TEXT,
    updated_at TEXT NOT NULL,
    eligible_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_import_records_status_eligible ON import_records(status, eligible_at);
CREATE INDEX IF NOT EXISTS idx_import_records_pattern ON import_records(url_pattern, anchor_text);
CREATE INDEX IF NOT EXISTS idx_import_records_updated ON import_records(updated_at);
CREATE INDEX IF NOT EXISTS idx_import_records_claimed ON import_records(status, claimed_at);

-- Fresh URLs observed for already-tracked documents
CREATE TABLE IF NOT EXISTS token_refreshes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    import_record_id INTEGER NOT NULL REFERENCES import_records(id),
    fresh_url TEXT NOT NULL,
    source_page_url TEXT,
    observed_at TEXT NOT NULL,
    consumed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_token_refreshes_record ON token_refreshes(import_record_id, consumed_at);

-- Imported domain records, partitioned by family
CREATE TABLE IF NOT EXISTS domain_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    family TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    fields TEXT NOT NULL,
    mapping_version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Dependent rows owned by a domain record, nested through parent_id
CREATE TABLE IF NOT EXISTS domain_children (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL REFERENCES domain_records(id) ON DELETE CASCADE,
    parent_id INTEGER REFERENCES domain_children(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    position INTEGER NOT NULL,
    fields TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_domain_children_record ON domain_children(record_id);
CREATE INDEX IF NOT EXISTS idx_domain_children_parent ON domain_children(parent_id);
"#;

/// Name of the natural-key uniqueness index
pub const NATURAL_KEY_INDEX: &str = "idx_domain_records_natural_key";

/// Uniqueness constraint backing the upsert conflict target
pub const NATURAL_KEY_INDEX_SQL: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_domain_records_natural_key ON domain_records(family, natural_key)";

/// Initializes the database schema
///
/// Returns whether the natural-key constraint is in place afterwards. It is
/// left out when legacy duplicates exist; deduplication adds it later.
pub fn initialize_schema(conn: &Connection) -> Result<bool, rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    ensure_natural_key_index(conn)
}

/// Creates the natural-key index unless duplicate keys would violate it
pub fn ensure_natural_key_index(conn: &Connection) -> Result<bool, rusqlite::Error> {
    if natural_key_index_exists(conn)? {
        return Ok(true);
    }

    if count_duplicate_groups(conn)? > 0 {
        return Ok(false);
    }

    conn.execute(NATURAL_KEY_INDEX_SQL, [])?;
    Ok(true)
}

pub fn natural_key_index_exists(conn: &Connection) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
        [NATURAL_KEY_INDEX],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Number of `(family, natural_key)` groups holding more than one record
pub fn count_duplicate_groups(conn: &Connection) -> Result<u64, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM (
            SELECT 1 FROM domain_records
            GROUP BY family, natural_key
            HAVING COUNT(*) > 1
        )",
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Gets the current schema version
pub fn get_schema_version() -> u32 {
    1
}
