//! Fetch/import worker
//!
//! One worker owns one store connection. It claims a resource, fetches it,
//! maps the body into an entity graph and upserts the graph. Any failure is
//! routed through the store's error transition so that one bad resource
//! never stops the others.

use crate::crawler::fetcher::Fetcher;
use crate::mapper::Mapper;
use crate::state::{Failure, FailureKind, ImportStatus, RetryPolicy};
use crate::storage::{
    DomainStore, FailureOutcome, ImportRecord, Storage, StorageError, UpsertOutcome,
};
use crate::SyncError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// Result of processing one import record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Fetched, mapped and committed
    Imported {
        record_id: i64,
        upsert: UpsertOutcome,
    },

    /// Routed through the error transition
    Failed {
        kind: FailureKind,
        outcome: FailureOutcome,
    },

    /// Still backing off; nothing was done
    Skipped,
}

/// Tally of a drain loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub imported: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Claims lost to another worker
    pub lost_claims: usize,
}

impl DrainSummary {
    pub fn merge(&mut self, other: DrainSummary) {
        self.imported += other.imported;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.lost_claims += other.lost_claims;
    }
}

/// Processes import records against one store connection
pub struct ImportWorker<S> {
    id: usize,
    storage: S,
    fetcher: Arc<dyn Fetcher>,
    mapper: Arc<dyn Mapper>,
    policy: RetryPolicy,
}

impl<S> ImportWorker<S>
where
    S: Storage + DomainStore,
{
    pub fn new(
        id: usize,
        storage: S,
        fetcher: Arc<dyn Fetcher>,
        mapper: Arc<dyn Mapper>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            storage,
            fetcher,
            mapper,
            policy,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Claims and imports one record
    ///
    /// Returns `Err` only for store failures and for guard errors: a record
    /// that is not `Discovered` (`InvalidTransition`) or a claim lost to
    /// another worker (`AlreadyClaimed`), including a claim that expired and
    /// was taken over while this worker was still fetching.
    pub async fn process(&mut self, record: &ImportRecord) -> Result<ProcessOutcome, SyncError> {
        if record.status != ImportStatus::Discovered {
            return Err(StorageError::InvalidTransition {
                url: record.url.clone(),
                from: record.status,
                to: ImportStatus::Claimed,
            }
            .into());
        }

        let claimed = match self.storage.claim(record.id, Utc::now()) {
            Ok(claimed) => claimed,
            Err(StorageError::NotYetEligible { url, eligible_at }) => {
                tracing::debug!("Worker {}: {} backs off until {}", self.id, url, eligible_at);
                return Ok(ProcessOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        let claimed_at = claimed.claimed_at.ok_or_else(|| {
            StorageError::Database(format!("claimed record {} has no claim time", claimed.url))
        })?;

        let fetch_url = self.storage.fetch_url_for(claimed.id)?;
        tracing::debug!("Worker {}: fetching {} ({})", self.id, fetch_url, claimed.family);

        let content = match self.fetcher.fetch(&fetch_url).await {
            Ok(content) => content,
            Err(e) => {
                return self.fail(&claimed, claimed_at, Failure::new(e.kind(), e.to_string()))
            }
        };

        self.storage.mark_fetched(claimed.id, claimed_at, Utc::now())?;

        let graph = match self.mapper.map(&claimed.family, &content.body) {
            Ok(graph) => graph,
            Err(e) => {
                let kind = e.failure_kind();
                if kind == FailureKind::SchemaDrift {
                    tracing::warn!("Schema drift at {}: {}", claimed.url, e);
                }
                return self.fail(&claimed, claimed_at, Failure::new(kind, e.to_string()));
            }
        };

        let upsert = match self.storage.upsert_entity(&graph, Utc::now()) {
            Ok(upsert) => upsert,
            Err(e) => {
                return self.fail(
                    &claimed,
                    claimed_at,
                    Failure::transient(format!("commit failed: {}", e)),
                )
            }
        };

        self.storage.mark_imported(claimed.id, claimed_at, Utc::now())?;

        tracing::debug!(
            "Worker {}: imported {} {} ({} child rows)",
            self.id,
            graph.family,
            graph.natural_key,
            upsert.children_written
        );

        Ok(ProcessOutcome::Imported {
            record_id: claimed.id,
            upsert,
        })
    }

    fn fail(
        &mut self,
        record: &ImportRecord,
        claimed_at: DateTime<Utc>,
        failure: Failure,
    ) -> Result<ProcessOutcome, SyncError> {
        let outcome = self.storage.record_failure(
            record.id,
            claimed_at,
            &failure,
            &self.policy,
            Utc::now(),
        )?;

        match outcome.status {
            ImportStatus::Abandoned => tracing::warn!(
                "Abandoned {} after {} errors: {}",
                record.url,
                outcome.error_count,
                failure
            ),
            ImportStatus::Error => {
                tracing::warn!("Parked {} for operator attention: {}", record.url, failure)
            }
            _ => tracing::debug!(
                "Retrying {} (attempt {}): {}",
                record.url,
                outcome.recrawl_count,
                failure
            ),
        }

        Ok(ProcessOutcome::Failed {
            kind: failure.kind,
            outcome,
        })
    }

    /// Processes claimable records until none are left or shutdown is signalled
    ///
    /// Each record is handled independently; a record that cannot be
    /// processed is logged and the loop moves on.
    pub async fn drain(
        &mut self,
        batch_size: u32,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<DrainSummary, SyncError> {
        let mut summary = DrainSummary::default();

        loop {
            let batch = self.storage.list_claimable(Utc::now(), batch_size)?;
            if batch.is_empty() {
                break;
            }

            let mut progressed = false;
            for record in &batch {
                if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
                    return Ok(summary);
                }

                match self.process(record).await {
                    Ok(ProcessOutcome::Imported { .. }) => {
                        summary.imported += 1;
                        progressed = true;
                    }
                    Ok(ProcessOutcome::Failed { .. }) => {
                        summary.failed += 1;
                        progressed = true;
                    }
                    Ok(ProcessOutcome::Skipped) => summary.skipped += 1,
                    Err(e) if e.is_already_claimed() => {
                        tracing::debug!("Worker {}: {}", self.id, e);
                        summary.lost_claims += 1;
                    }
                    // Another worker claimed and finished it since listing
                    Err(SyncError::Storage(StorageError::InvalidTransition {
                        url,
                        from,
                        to: ImportStatus::Claimed,
                    })) => {
                        tracing::debug!("Worker {}: {} already {}", self.id, url, from);
                        summary.lost_claims += 1;
                    }
                    Err(e) if e.is_invalid_transition() => {
                        tracing::error!("Worker {}: {}", self.id, e);
                    }
                    Err(e) => return Err(e),
                }
            }

            if !progressed {
                break;
            }
        }

        Ok(summary)
    }
}
