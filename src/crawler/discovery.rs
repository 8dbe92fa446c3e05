//! Discovery collector
//!
//! Turns links found on listing pages into tracked import records. Discovery
//! only ever adds: new resources become `Discovered` records, and a known
//! document seen under a fresh token becomes a token-refresh candidate for
//! the scheduler. Existing records are never modified here.

use crate::storage::{NewImportRecord, Storage, StorageResult};
use crate::url::{derive_url_pattern, normalize_url, PatternRules};
use chrono::{DateTime, Utc};

/// A link found on a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLink {
    pub url: String,
    pub anchor_text: Option<String>,
    pub source_page_url: Option<String>,
}

impl DiscoveredLink {
    pub fn new(url: impl Into<String>, anchor_text: Option<&str>) -> Self {
        Self {
            url: url.into(),
            anchor_text: anchor_text.map(str::to_string),
            source_page_url: None,
        }
    }
}

/// What one discovery batch did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub inserted: usize,
    pub already_tracked: usize,
    pub token_refreshes: usize,
    pub rejected: usize,
}

impl DiscoveryReport {
    pub fn merge(&mut self, other: DiscoveryReport) {
        self.inserted += other.inserted;
        self.already_tracked += other.already_tracked;
        self.token_refreshes += other.token_refreshes;
        self.rejected += other.rejected;
    }

    pub fn total(&self) -> usize {
        self.inserted + self.already_tracked + self.token_refreshes + self.rejected
    }
}

/// Registers discovered links against the import status store
#[derive(Debug, Clone, Default)]
pub struct DiscoveryCollector {
    rules: PatternRules,
}

impl DiscoveryCollector {
    pub fn new(rules: PatternRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &PatternRules {
        &self.rules
    }

    /// Registers a batch of links for one entity family
    ///
    /// # Arguments
    ///
    /// * `storage` - The import status store
    /// * `family` - Entity family the linked resources belong to
    /// * `links` - Links extracted from listing pages
    /// * `now` - Discovery time
    pub fn collect<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        family: &str,
        links: &[DiscoveredLink],
        now: DateTime<Utc>,
    ) -> StorageResult<DiscoveryReport> {
        let mut report = DiscoveryReport::default();

        for link in links {
            let url = match normalize_url(&link.url) {
                Ok(url) => url,
                Err(e) => {
                    tracing::debug!("Rejected link {}: {}", link.url, e);
                    report.rejected += 1;
                    continue;
                }
            };
            let url_str = url.to_string();

            if storage.get_import_record_by_url(&url_str)?.is_some() {
                report.already_tracked += 1;
                continue;
            }

            let url_pattern = derive_url_pattern(&url, &self.rules);
            let anchor_text = link.anchor_text.as_deref();

            let matches = storage.find_by_pattern(&url_pattern, anchor_text)?;
            if let Some(latest) = matches.first() {
                let recorded = storage.record_token_refresh(
                    latest.id,
                    &url_str,
                    link.source_page_url.as_deref(),
                    now,
                )?;

                if recorded {
                    // Only imported records are re-admitted; others pick the
                    // fresh URL up on their next claim.
                    tracing::debug!(
                        "Token refresh for {} ({}): {}",
                        latest.url,
                        latest.status,
                        url_str
                    );
                    report.token_refreshes += 1;
                } else {
                    report.already_tracked += 1;
                }
                continue;
            }

            let record = NewImportRecord {
                url: url_str,
                source_page_url: link.source_page_url.clone(),
                anchor_text: link.anchor_text.clone(),
                url_pattern,
                family: family.to_string(),
            };

            match storage.register_discovered(&record, now)? {
                Some(id) => {
                    tracing::debug!("Discovered {} (record {})", record.url, id);
                    report.inserted += 1;
                }
                None => report.already_tracked += 1,
            }
        }

        Ok(report)
    }
}
