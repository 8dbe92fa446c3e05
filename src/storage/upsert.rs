//! Idempotent upserts of entity graphs keyed by natural key
//!
//! The parent row is written with `ON CONFLICT (family, natural_key) DO UPDATE`
//! and its dependent rows are deleted and reinserted, all inside one
//! IMMEDIATE transaction. A crash before commit leaves the previous version
//! untouched; importing the same content twice leaves the same rows.

use crate::entity::{ChildRow, EntityGraph, Fields, NaturalKey};
use crate::storage::schema::{
    count_duplicate_groups, natural_key_index_exists, NATURAL_KEY_INDEX_SQL,
};
use crate::storage::traits::{DomainStore, StorageError, StorageResult};
use crate::storage::{
    format_timestamp, parse_timestamp, ChildRecord, DedupReport, DomainRecord, SqliteStorage,
    UpsertOutcome,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

impl DomainStore for SqliteStorage {
    fn has_natural_key_constraint(&self) -> StorageResult<bool> {
        Ok(natural_key_index_exists(&self.conn)?)
    }

    fn upsert_entity(
        &mut self,
        graph: &EntityGraph,
        now: DateTime<Utc>,
    ) -> StorageResult<UpsertOutcome> {
        let key = graph.natural_key.canonical();
        let fields = serde_json::to_string(&graph.fields)?;
        let ts = format_timestamp(&now);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !natural_key_index_exists(&tx)? {
            return Err(StorageError::MissingNaturalKeyConstraint {
                family: graph.family.clone(),
            });
        }

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM domain_records WHERE family = ?1 AND natural_key = ?2",
                params![graph.family, key],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO domain_records (family, natural_key, fields, mapping_version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (family, natural_key) DO UPDATE SET
                 fields = excluded.fields,
                 mapping_version = excluded.mapping_version,
                 updated_at = excluded.updated_at",
            params![graph.family, key, fields, graph.mapping_version, ts],
        )?;

        let record_id = match existing {
            Some(id) => id,
            None => tx.last_insert_rowid(),
        };

        let children_removed = delete_children(&tx, record_id)?;
        let children_written = insert_children(&tx, record_id, None, &graph.children)?;

        tx.commit()?;

        tracing::debug!(
            "Upserted {} {} (record {}, {} child rows)",
            graph.family,
            key,
            record_id,
            children_written
        );

        Ok(UpsertOutcome {
            record_id,
            inserted: existing.is_none(),
            children_removed,
            children_written,
        })
    }

    fn get_domain_record(
        &self,
        family: &str,
        natural_key: &NaturalKey,
    ) -> StorageResult<Option<DomainRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, family, natural_key, fields, mapping_version, created_at, updated_at
                 FROM domain_records
                 WHERE family = ?1 AND natural_key = ?2
                 ORDER BY id
                 LIMIT 1",
                params![family, natural_key.canonical()],
                row_to_domain_record,
            )
            .optional()?;
        Ok(record)
    }

    fn get_children(&self, record_id: i64) -> StorageResult<Vec<ChildRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, record_id, parent_id, kind, position, fields
             FROM domain_children
             WHERE record_id = ?1
             ORDER BY id",
        )?;

        let children = stmt
            .query_map(params![record_id], |row| {
                Ok(ChildRecord {
                    id: row.get(0)?,
                    record_id: row.get(1)?,
                    parent_id: row.get(2)?,
                    kind: row.get(3)?,
                    position: row.get(4)?,
                    fields: fields_column(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(children)
    }

    fn count_domain_records(&self) -> StorageResult<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT family, COUNT(*) FROM domain_records GROUP BY family ORDER BY family",
        )?;

        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(counts)
    }

    fn dedup_domain_records(&mut self) -> StorageResult<DedupReport> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let duplicate_groups = count_duplicate_groups(&tx)? as usize;

        let removed_record_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT d.id FROM domain_records d
                 WHERE d.id > (
                     SELECT MIN(m.id) FROM domain_records m
                     WHERE m.family = d.family AND m.natural_key = d.natural_key
                 )
                 ORDER BY d.id",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut removed_children = 0;
        for id in &removed_record_ids {
            removed_children += delete_children(&tx, *id)?;
            tx.execute("DELETE FROM domain_records WHERE id = ?1", params![id])?;
        }

        let constraint_added = !natural_key_index_exists(&tx)?;
        tx.execute(NATURAL_KEY_INDEX_SQL, [])?;
        tx.commit()?;

        if !removed_record_ids.is_empty() {
            tracing::info!(
                "Removed {} duplicate domain records across {} natural keys",
                removed_record_ids.len(),
                duplicate_groups
            );
        }

        Ok(DedupReport {
            duplicate_groups,
            removed_record_ids,
            removed_children,
            constraint_added,
        })
    }
}

/// Deletes every child row of a record, returning how many were removed
///
/// Nested rows go with their parents through `ON DELETE CASCADE`, which the
/// DELETE's own change count leaves out, so they are counted first.
fn delete_children(conn: &Connection, record_id: i64) -> StorageResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM domain_children WHERE record_id = ?1",
        params![record_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "DELETE FROM domain_children WHERE record_id = ?1",
        params![record_id],
    )?;
    Ok(count as usize)
}

/// Inserts a child subtree depth-first, returning the number of rows written
fn insert_children(
    conn: &Connection,
    record_id: i64,
    parent_id: Option<i64>,
    rows: &[ChildRow],
) -> StorageResult<usize> {
    let mut written = 0;

    for (position, row) in rows.iter().enumerate() {
        conn.execute(
            "INSERT INTO domain_children (record_id, parent_id, kind, position, fields)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record_id,
                parent_id,
                row.kind,
                position as i64,
                serde_json::to_string(&row.fields)?
            ],
        )?;
        let child_id = conn.last_insert_rowid();
        written += 1 + insert_children(conn, record_id, Some(child_id), &row.children)?;
    }

    Ok(written)
}

fn fields_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Fields> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_domain_record(row: &Row<'_>) -> rusqlite::Result<DomainRecord> {
    let created_raw: String = row.get(5)?;
    let updated_raw: String = row.get(6)?;

    Ok(DomainRecord {
        id: row.get(0)?,
        family: row.get(1)?,
        natural_key: row.get(2)?,
        fields: fields_column(row, 3)?,
        mapping_version: row.get(4)?,
        created_at: parse_timestamp(&created_raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        updated_at: parse_timestamp(&updated_raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
    })
}
