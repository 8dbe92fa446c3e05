//! Statistics generation from the sync database
//!
//! Gathers everything an operator needs to decide on manual action: records
//! parked by schema drift, abandoned resources, pending token refreshes.

use crate::state::ImportStatus;
use crate::storage::{DomainStore, ImportRecord, RunRecord, Storage, StorageResult};
use std::collections::HashMap;

/// Sync statistics summary
#[derive(Debug, Clone)]
pub struct SyncStatistics {
    /// Total number of tracked resources
    pub total_records: u64,

    /// Count of tracked resources by status
    pub records_by_status: HashMap<ImportStatus, u64>,

    /// Records parked in `Error` awaiting a mapping update
    pub parked: Vec<ImportRecord>,

    /// Records whose retry budget ran out
    pub abandoned: Vec<ImportRecord>,

    /// Imported records with an unconsumed token refresh
    pub pending_refreshes: u64,

    /// Domain records per entity family
    pub domain_records: Vec<(String, u64)>,

    pub latest_run: Option<RunRecord>,
}

impl SyncStatistics {
    pub fn count(&self, status: ImportStatus) -> u64 {
        self.records_by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Loads statistics from storage
pub fn load_statistics<S>(storage: &S) -> StorageResult<SyncStatistics>
where
    S: Storage + DomainStore + ?Sized,
{
    let mut records_by_status = HashMap::new();
    for status in ImportStatus::all_states() {
        let count = storage.count_by_status(status)?;
        if count > 0 {
            records_by_status.insert(status, count);
        }
    }

    Ok(SyncStatistics {
        total_records: storage.count_import_records()?,
        records_by_status,
        parked: storage.get_records_by_status(ImportStatus::Error)?,
        abandoned: storage.get_records_by_status(ImportStatus::Abandoned)?,
        pending_refreshes: storage.list_pending_token_refreshes()?.len() as u64,
        domain_records: storage.count_domain_records()?,
        latest_run: storage.get_latest_run()?,
    })
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &SyncStatistics) {
    println!("=== Sync Statistics ===\n");

    if let Some(run) = &stats.latest_run {
        println!(
            "Latest run: #{} {} (started {}{})",
            run.id,
            run.status.to_db_string(),
            run.started_at,
            run.finished_at
                .as_ref()
                .map(|f| format!(", finished {}", f))
                .unwrap_or_default()
        );
        println!();
    }

    println!("Tracked resources: {}", stats.total_records);
    for status in ImportStatus::all_states() {
        let count = stats.count(status);
        if count == 0 {
            continue;
        }
        let percentage = (count as f64 / stats.total_records.max(1) as f64) * 100.0;
        println!("  {}: {} ({:.1}%)", status, count, percentage);
    }
    println!();

    if stats.pending_refreshes > 0 {
        println!("Pending token refreshes: {}", stats.pending_refreshes);
        println!();
    }

    if !stats.domain_records.is_empty() {
        println!("Domain records:");
        for (family, count) in &stats.domain_records {
            println!("  {}: {}", family, count);
        }
        println!();
    }

    if !stats.parked.is_empty() {
        println!("Awaiting mapping update ({}):", stats.parked.len());
        for record in &stats.parked {
            print_record(record);
        }
        println!();
    }

    if !stats.abandoned.is_empty() {
        println!("Abandoned ({}):", stats.abandoned.len());
        for record in &stats.abandoned {
            print_record(record);
        }
        println!();
    }
}

fn print_record(record: &ImportRecord) {
    match &record.last_error {
        Some(error) => println!(
            "  - [{}] {} ({}: {})",
            record.family, record.url, error.kind, error.message
        ),
        None => println!("  - [{}] {}", record.family, record.url),
    }
}
