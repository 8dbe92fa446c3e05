//! Sync coordinator - top-level orchestration
//!
//! This module ties the pieces together:
//! - Scanning listing pages and registering discovered links
//! - Running the recrawl scheduler
//! - Spawning import workers, each with its own store connection
//! - Recording the run and handling interrupts

use crate::config::Config;
use crate::crawler::discovery::{DiscoveryCollector, DiscoveryReport};
use crate::crawler::fetcher::{Fetcher, HttpFetcher};
use crate::crawler::parser::{extract_links, filter_links};
use crate::crawler::scheduler::{RecrawlReport, RecrawlScheduler};
use crate::crawler::worker::{DrainSummary, ImportWorker};
use crate::mapper::{JsonMapper, Mapper};
use crate::storage::{open_storage, DomainStore, RunStatus, SqliteStorage, Storage};
use crate::SyncError;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use url::Url;

/// How long a run keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Rescan listings and drain on a schedule until interrupted
    Continuous,

    /// One discovery pass, one scheduler pass, drain what is claimable, exit
    Once,
}

/// Totals for a whole run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub discovery: DiscoveryReport,
    pub recrawl: RecrawlReport,
    pub drain: DrainSummary,
}

/// Main sync coordinator
pub struct Coordinator {
    config: Arc<Config>,
    fetcher: Arc<dyn Fetcher>,
    mapper: Arc<dyn Mapper>,
    collector: DiscoveryCollector,
    scheduler: RecrawlScheduler,
}

impl Coordinator {
    /// Creates a coordinator using the HTTP fetcher and JSON mapper
    pub fn new(config: Config) -> Result<Self, SyncError> {
        let fetcher = HttpFetcher::new(&config.user_agent, config.worker.request_timeout())?;
        let mapper = JsonMapper::new(config.mapping.iter().cloned());
        Ok(Self::with_components(
            config,
            Arc::new(fetcher),
            Arc::new(mapper),
        ))
    }

    /// Creates a coordinator around caller-supplied collaborators
    pub fn with_components(
        config: Config,
        fetcher: Arc<dyn Fetcher>,
        mapper: Arc<dyn Mapper>,
    ) -> Self {
        let collector = DiscoveryCollector::new(config.discovery.pattern_rules());
        let scheduler = RecrawlScheduler::new(config.retry.policy(), config.worker.claim_timeout());

        Self {
            config: Arc::new(config),
            fetcher,
            mapper,
            collector,
            scheduler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens a fresh connection to the configured store
    pub fn open_storage(&self) -> Result<SqliteStorage, SyncError> {
        open_storage(Path::new(&self.config.store.database_path))
    }

    /// Fetches every configured listing page and registers its links
    ///
    /// A listing that cannot be fetched is logged and skipped; the others
    /// are still scanned.
    pub async fn discover<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
    ) -> Result<DiscoveryReport, SyncError> {
        let mut report = DiscoveryReport::default();

        for listing in &self.config.listing {
            let content = match self.fetcher.fetch(&listing.url).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("Listing {} unavailable: {}", listing.url, e);
                    continue;
                }
            };

            let base = match Url::parse(&content.final_url) {
                Ok(base) => base,
                Err(_) => Url::parse(&listing.url)?,
            };

            let links = extract_links(&content.text(), &base);
            let links = filter_links(links, listing.href_contains.as_deref());
            let found = links.len();

            let batch = self
                .collector
                .collect(storage, &listing.family, &links, Utc::now())?;

            tracing::info!(
                "Listing {}: {} links, {} new, {} token refreshes",
                listing.url,
                found,
                batch.inserted,
                batch.token_refreshes
            );
            report.merge(batch);
        }

        Ok(report)
    }

    /// Runs discovery, scheduling and import workers
    ///
    /// Refuses to start while duplicate natural keys keep the uniqueness
    /// constraint from being installed.
    pub async fn run(
        self: Arc<Self>,
        mode: RunMode,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary, SyncError> {
        let mut storage = self.open_storage()?;
        if !storage.has_natural_key_constraint()? {
            return Err(SyncError::DedupRequired);
        }

        let mut summary = RunSummary::default();

        match mode {
            RunMode::Once => {
                summary.discovery = self.discover(&mut storage).await?;
                summary.recrawl = self.scheduler.run_pass(&mut storage, Utc::now())?;
                summary.drain = self.clone().spawn_workers(mode, shutdown).await?;
            }
            RunMode::Continuous => {
                let scheduler = self.scheduler.clone();
                let period = self.config.recrawl.interval();
                let mut scheduler_storage = self.open_storage()?;
                let scheduler_shutdown = shutdown.clone();
                let scheduler_task = tokio::spawn(async move {
                    scheduler
                        .run_periodic(&mut scheduler_storage, period, scheduler_shutdown)
                        .await
                });

                let workers = tokio::spawn(self.clone().spawn_workers(mode, shutdown.clone()));

                summary.discovery = self.discovery_loop(&mut storage, shutdown).await;

                summary.drain = workers
                    .await
                    .map_err(|e| SyncError::Task(e.to_string()))??;
                summary.recrawl = scheduler_task
                    .await
                    .map_err(|e| SyncError::Task(e.to_string()))?;
            }
        }

        tracing::info!(
            "Run finished: {} imported, {} failed, {} new resources, {} token refreshes",
            summary.drain.imported,
            summary.drain.failed,
            summary.discovery.inserted,
            summary.recrawl.readmitted
        );

        Ok(summary)
    }

    /// Rescans listings on the recrawl interval until shutdown
    async fn discovery_loop(
        &self,
        storage: &mut SqliteStorage,
        mut shutdown: watch::Receiver<bool>,
    ) -> DiscoveryReport {
        let mut total = DiscoveryReport::default();
        let mut ticker = time::interval(self.config.recrawl.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.discover(storage).await {
                        Ok(report) => total.merge(report),
                        Err(e) => tracing::error!("Discovery pass failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Discovery received shutdown signal");
                        break;
                    }
                }
            }
        }

        total
    }

    /// Runs the configured number of workers and sums their results
    async fn spawn_workers(
        self: Arc<Self>,
        mode: RunMode,
        shutdown: watch::Receiver<bool>,
    ) -> Result<DrainSummary, SyncError> {
        let mut tasks = JoinSet::new();

        for id in 0..self.config.worker.count {
            let storage = self.open_storage()?;
            let worker = ImportWorker::new(
                id,
                storage,
                self.fetcher.clone(),
                self.mapper.clone(),
                self.config.retry.policy(),
            );
            tasks.spawn(self.clone().worker_loop(worker, mode, shutdown.clone()));
        }

        let mut total = DrainSummary::default();
        let mut first_error = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(drained)) => total.merge(drained),
                Ok(Err(e)) => {
                    tracing::error!("Worker stopped: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(SyncError::Task(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        mut worker: ImportWorker<SqliteStorage>,
        mode: RunMode,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<DrainSummary, SyncError> {
        let batch_size = self.config.worker.batch_size;
        let poll_interval = self.config.worker.poll_interval();
        let mut total = DrainSummary::default();

        loop {
            match worker.drain(batch_size, Some(&shutdown)).await {
                Ok(drained) => total.merge(drained),
                Err(e) if mode == RunMode::Once => return Err(e),
                Err(e) => tracing::error!("Worker drain failed: {}", e),
            }

            if mode == RunMode::Once || *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        Ok(total)
    }
}

/// Runs a complete sync and records it in the run history
///
/// Ctrl-C flips the shutdown channel; workers finish the resource in hand
/// and the run is recorded as interrupted.
///
/// # Example
///
/// ```no_run
/// use chamber_sync::config::load_config_with_hash;
/// use chamber_sync::crawler::{run_sync, RunMode};
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (config, hash) = load_config_with_hash(Path::new("chamber-sync.toml"))?;
/// run_sync(config, &hash, RunMode::Once).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_sync(
    config: Config,
    config_hash: &str,
    mode: RunMode,
) -> Result<RunSummary, SyncError> {
    let coordinator = Arc::new(Coordinator::new(config)?);
    let mut storage = coordinator.open_storage()?;

    if let Some(previous) = storage.get_latest_run()? {
        if previous.status == RunStatus::Running {
            tracing::warn!(
                "Run {} did not finish cleanly; marking it interrupted",
                previous.id
            );
            storage.finish_run(previous.id, RunStatus::Interrupted)?;
        }
    }

    let run_id = storage.create_run(config_hash)?;
    tracing::info!("Starting sync run {} ({:?})", run_id, mode);

    let (tx, rx) = watch::channel(false);
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing in-flight resources");
            let _ = tx.send(true);
        }
    });

    let result = coordinator.run(mode, rx.clone()).await;
    signal.abort();

    let status = match (&result, *rx.borrow()) {
        (Err(_), _) => RunStatus::Failed,
        (Ok(_), true) => RunStatus::Interrupted,
        (Ok(_), false) => RunStatus::Completed,
    };
    storage.finish_run(run_id, status)?;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::crawler::fetcher::{FetchError, FetchedContent};
    use crate::state::ImportStatus;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const LISTING: &str = "https://example.org/deputies";

    struct StaticFetcher {
        pages: HashMap<String, String>,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
            match self.pages.get(url) {
                Some(body) => Ok(FetchedContent {
                    final_url: url.to_string(),
                    status_code: 200,
                    content_type: None,
                    body: body.clone().into_bytes(),
                }),
                None => Err(FetchError::Http {
                    url: url.to_string(),
                    status: 404,
                }),
            }
        }
    }

    fn config(db: &Path) -> Config {
        parse_config(&format!(
            r#"
[store]
database-path = "{}"

[worker]
count = 2

[user-agent]
crawler-name = "ChamberSync"
crawler-version = "0.3"
contact-url = "https://example.org/bot"
contact-email = "ops@example.org"

[[listing]]
url = "{}"
family = "deputy"
href-contains = "/deputy/"

[[mapping]]
family = "deputy"
natural-key = ["deputy_id"]
fields = ["name"]
"#,
            db.display(),
            LISTING
        ))
        .unwrap()
    }

    fn coordinator(dir: &TempDir) -> Arc<Coordinator> {
        let config = config(&dir.path().join("sync.db"));
        let mut pages = HashMap::new();
        pages.insert(
            LISTING.to_string(),
            r#"<a href="/deputy/1">Ada</a> <a href="/deputy/2">Grace</a> <a href="/about">About</a>"#
                .to_string(),
        );
        pages.insert(
            "https://example.org/deputy/1".to_string(),
            r#"{"deputy_id": 1, "name": "Ada"}"#.to_string(),
        );
        let mapper = JsonMapper::new(config.mapping.iter().cloned());
        Arc::new(Coordinator::with_components(
            config,
            Arc::new(StaticFetcher { pages }),
            Arc::new(mapper),
        ))
    }

    #[tokio::test]
    async fn test_run_once_discovers_and_imports() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);
        let (_tx, rx) = watch::channel(false);

        let summary = coordinator.clone().run(RunMode::Once, rx).await.unwrap();
        assert_eq!(summary.discovery.inserted, 2);
        assert_eq!(summary.drain.imported, 1);
        assert_eq!(summary.drain.failed, 1);

        let storage = coordinator.open_storage().unwrap();
        assert_eq!(storage.count_by_status(ImportStatus::Imported).unwrap(), 1);
        assert_eq!(
            storage.count_domain_records().unwrap(),
            vec![("deputy".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);
        let mut storage = coordinator.open_storage().unwrap();

        let first = coordinator.discover(&mut storage).await.unwrap();
        let second = coordinator.discover(&mut storage).await.unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.already_tracked, 2);
    }

    #[tokio::test]
    async fn test_refuses_to_start_without_constraint() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);
        coordinator.open_storage().unwrap();
        rusqlite::Connection::open(dir.path().join("sync.db"))
            .unwrap()
            .execute_batch(&format!(
                "DROP INDEX {};
                 INSERT INTO domain_records (family, natural_key, fields, created_at, updated_at)
                 VALUES ('deputy', 'deputy_id=1', '{{}}', '2025-01-01T00:00:00.000000Z', '2025-01-01T00:00:00.000000Z');
                 INSERT INTO domain_records (family, natural_key, fields, created_at, updated_at)
                 VALUES ('deputy', 'deputy_id=1', '{{}}', '2025-01-02T00:00:00.000000Z', '2025-01-02T00:00:00.000000Z');",
                crate::storage::NATURAL_KEY_INDEX
            ))
            .unwrap();
        let (_tx, rx) = watch::channel(false);

        let result = coordinator.run(RunMode::Once, rx).await;
        assert!(matches!(result, Err(SyncError::DedupRequired)));
    }

    #[tokio::test]
    async fn test_continuous_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(coordinator.clone().run(RunMode::Continuous, rx));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.discovery.inserted, 2);
    }
}
