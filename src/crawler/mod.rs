//! Crawler module: discovery, fetching, importing and scheduling
//!
//! This module contains the moving parts of a sync run:
//! - Listing-page link extraction and discovery registration
//! - HTTP fetching with failure classification
//! - Import workers that claim, fetch, map and upsert
//! - The recrawl scheduler for expired claims and token refreshes
//! - Overall run coordination

mod coordinator;
mod discovery;
mod fetcher;
mod parser;
mod scheduler;
mod worker;

pub use coordinator::{run_sync, Coordinator, RunMode, RunSummary};
pub use discovery::{DiscoveredLink, DiscoveryCollector, DiscoveryReport};
pub use fetcher::{
    build_http_client, classify_status, FetchError, FetchedContent, Fetcher, HttpFetcher,
};
pub use parser::{extract_links, filter_links};
pub use scheduler::{RecrawlReport, RecrawlScheduler, CLAIM_EXPIRED};
pub use worker::{DrainSummary, ImportWorker, ProcessOutcome};
