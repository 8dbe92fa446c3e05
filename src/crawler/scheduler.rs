//! Recrawl scheduler
//!
//! This module handles:
//! - Expiring claims held by workers that died or stalled
//! - Re-admitting imported documents observed under a fresh token
//!
//! Retry timing needs no pass of its own: a retried record is already
//! `Discovered` with an `eligible_at` in the future.

use crate::state::{Failure, ImportStatus, RetryPolicy};
use crate::storage::{Storage, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

/// Message recorded against claims swept by the liveness check
pub const CLAIM_EXPIRED: &str = "claim expired";

/// What one scheduler pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecrawlReport {
    /// Expired claims routed through the error transition
    pub swept: usize,
    /// Swept records re-admitted with backoff
    pub retried: usize,
    /// Swept records whose retry budget ran out
    pub abandoned: usize,
    /// Imported records re-admitted for a token refresh
    pub readmitted: usize,
}

impl RecrawlReport {
    pub fn merge(&mut self, other: RecrawlReport) {
        self.swept += other.swept;
        self.retried += other.retried;
        self.abandoned += other.abandoned;
        self.readmitted += other.readmitted;
    }

    pub fn is_empty(&self) -> bool {
        self.swept == 0 && self.readmitted == 0
    }
}

/// Periodic maintenance of the import status store
#[derive(Debug, Clone)]
pub struct RecrawlScheduler {
    policy: RetryPolicy,
    claim_timeout: Duration,
}

impl RecrawlScheduler {
    pub fn new(policy: RetryPolicy, claim_timeout: Duration) -> Self {
        Self {
            policy,
            claim_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs one maintenance pass
    ///
    /// 1. Claims older than the claim timeout are failed as transient.
    /// 2. Imported records with pending token refreshes go back to `Discovered`
    ///    without touching their retry budget.
    ///
    /// `Error` records are never selected.
    pub fn run_pass<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        now: DateTime<Utc>,
    ) -> StorageResult<RecrawlReport> {
        let mut report = RecrawlReport::default();

        let timeout = chrono::Duration::from_std(self.claim_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = now - timeout;

        for record in storage.list_stale_claims(cutoff)? {
            let Some(claimed_at) = record.claimed_at else {
                continue;
            };
            let failure = Failure::transient(CLAIM_EXPIRED);
            match storage.record_failure(record.id, claimed_at, &failure, &self.policy, now) {
                Ok(outcome) => {
                    report.swept += 1;
                    match outcome.status {
                        ImportStatus::Discovered => report.retried += 1,
                        ImportStatus::Abandoned => {
                            tracing::warn!(
                                "Abandoned {} after {} errors: {}",
                                record.url,
                                outcome.error_count,
                                CLAIM_EXPIRED
                            );
                            report.abandoned += 1;
                        }
                        _ => {}
                    }
                }
                // The worker finished between listing and sweeping
                Err(StorageError::InvalidTransition { url, from, .. }) => {
                    tracing::debug!("Claim on {} resolved concurrently ({})", url, from);
                }
                Err(StorageError::AlreadyClaimed { url }) => {
                    tracing::debug!("Claim on {} was replaced concurrently", url);
                }
                Err(e) => return Err(e),
            }
        }

        for record in storage.list_pending_token_refreshes()? {
            match storage.readmit_token_refresh(record.id, now) {
                Ok(()) => {
                    tracing::debug!("Re-admitted {} for token refresh", record.url);
                    report.readmitted += 1;
                }
                Err(StorageError::InvalidTransition { url, from, .. }) => {
                    tracing::debug!("Skipped token refresh for {} ({})", url, from);
                }
                Err(e) => return Err(e),
            }
        }

        if !report.is_empty() {
            tracing::info!(
                "Scheduler pass: {} expired claims ({} retried, {} abandoned), {} token refreshes",
                report.swept,
                report.retried,
                report.abandoned,
                report.readmitted
            );
        }

        Ok(report)
    }

    /// Runs passes on a fixed period until shutdown is signalled
    ///
    /// A failed pass is logged and retried on the next tick.
    pub async fn run_periodic<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> RecrawlReport {
        let mut total = RecrawlReport::default();
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_pass(storage, Utc::now()) {
                        Ok(report) => total.merge(report),
                        Err(e) => tracing::error!("Scheduler pass failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Scheduler received shutdown signal");
                        break;
                    }
                }
            }
        }

        total
    }
}
