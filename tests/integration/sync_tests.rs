//! Integration tests for the sync engine
//!
//! These tests use wiremock for the publisher and a temporary SQLite file for
//! the store, and drive full discovery/import cycles end-to-end.

use chamber_sync::config::{load_config_with_hash, parse_config, Config, UserAgentConfig};
use chamber_sync::crawler::{run_sync, Coordinator, FetchError, Fetcher, HttpFetcher, RunMode};
use chamber_sync::entity::{ChildRow, EntityGraph, Fields, NaturalKey};
use chamber_sync::state::{FailureKind, ImportStatus};
use chamber_sync::storage::{
    DomainStore, NewImportRecord, RunStatus, SqliteStorage, Storage, StorageError,
};
use chamber_sync::SyncError;
use chrono::Utc;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::watch;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN_A: &str = "Zm9vYmFyOTk4ODc3NjY1NTQ0MzMyMjEx";
const TOKEN_B: &str = "YmF6cXV4MTEyMjMzNDQ1NTY2Nzc4ODk5";

fn test_config(db_path: &Path, listing_url: Option<&str>) -> Config {
    let listing = listing_url
        .map(|url| {
            format!(
                "[[listing]]\nurl = \"{}\"\nfamily = \"budget_proposal\"\nhref-contains = \"/doc\"\n",
                url
            )
        })
        .unwrap_or_default();

    parse_config(&format!(
        r#"
[store]
database-path = "{}"

[worker]
count = 2
poll-interval-ms = 50

[user-agent]
crawler-name = "TestBot"
crawler-version = "1.0.0"
contact-url = "https://example.com/contact"
contact-email = "test@example.com"

{}
[[mapping]]
family = "budget_proposal"
natural-key = ["proposal_id"]
fields = ["title"]

[[mapping.children]]
kind = "article"
source = "articles"
fields = ["number", "text"]
"#,
        db_path.display(),
        listing
    ))
    .expect("test config is valid")
}

fn listing_page(token: &str) -> String {
    format!(
        r#"<html><body>
        <a href="/doc?id=42&tk={}">Proposal 42</a>
        <a href="/about">About the chamber</a>
        </body></html>"#,
        token
    )
}

fn user_agent() -> UserAgentConfig {
    UserAgentConfig {
        crawler_name: "TestBot".to_string(),
        crawler_version: "1.0.0".to_string(),
        contact_url: "https://example.com/contact".to_string(),
        contact_email: "test@example.com".to_string(),
    }
}

async fn run_once(config: Config) -> chamber_sync::crawler::RunSummary {
    let coordinator = Arc::new(Coordinator::new(config).expect("coordinator"));
    let (_tx, rx) = watch::channel(false);
    coordinator
        .run(RunMode::Once, rx)
        .await
        .expect("run succeeds")
}

#[tokio::test]
async fn test_token_rotation_updates_in_place() {
    let mock_server = MockServer::start().await;
    let base_url = mock_server.uri();
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sync.db");
    let listing_url = format!("{}/proposals", base_url);

    Mock::given(method("GET"))
        .and(path("/proposals"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(TOKEN_A)))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .and(query_param("tk", TOKEN_A))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"proposal_id": 42, "title": "Budget 2026",
                "articles": [{"number": 1, "text": "Revenue"}, {"number": 2, "text": "Spending"}]}"#,
        ))
        .mount(&mock_server)
        .await;

    let first = run_once(test_config(&db_path, Some(&listing_url))).await;
    assert_eq!(first.discovery.inserted, 1);
    assert_eq!(first.drain.imported, 1);

    // The publisher rotates its session token; the old one now fails
    mock_server.reset().await;
    Mock::given(method("GET"))
        .and(path("/proposals"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(TOKEN_B)))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .and(query_param("tk", TOKEN_B))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"proposal_id": 42, "title": "Budget 2026 (amended)",
                "articles": [{"number": 1, "text": "Revenue"}]}"#,
        ))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .and(query_param("tk", TOKEN_A))
        .respond_with(ResponseTemplate::new(403))
        .expect(0)
        .mount(&mock_server)
        .await;

    let second = run_once(test_config(&db_path, Some(&listing_url))).await;
    assert_eq!(second.discovery.inserted, 0);
    assert_eq!(second.discovery.token_refreshes, 1);
    assert_eq!(second.recrawl.readmitted, 1);
    assert_eq!(second.drain.imported, 1);

    let storage = SqliteStorage::new(&db_path).unwrap();
    assert_eq!(storage.count_import_records().unwrap(), 1);
    assert_eq!(storage.count_by_status(ImportStatus::Imported).unwrap(), 1);
    assert!(storage.list_pending_token_refreshes().unwrap().is_empty());
    assert_eq!(
        storage.count_domain_records().unwrap(),
        vec![("budget_proposal".to_string(), 1)]
    );

    let record = storage
        .get_domain_record("budget_proposal", &NaturalKey::single("proposal_id", "42"))
        .unwrap()
        .expect("record exists");
    assert_eq!(record.fields["title"], "Budget 2026 (amended)");
    assert_eq!(storage.get_children(record.id).unwrap().len(), 1);

    // A third scan with the same token changes nothing
    let third = run_once(test_config(&db_path, Some(&listing_url))).await;
    assert_eq!(third.discovery.token_refreshes, 0);
    assert_eq!(third.drain.imported, 0);
}

#[tokio::test]
async fn test_fetch_failures_are_classified() {
    let mock_server = MockServer::start().await;
    let ua = user_agent();

    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/throttled"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .and(header("user-agent", ua.header_value().as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&mock_server)
        .await;

    let fetcher = HttpFetcher::new(&ua, Duration::from_secs(5)).unwrap();
    let url = |p: &str| format!("{}{}", mock_server.uri(), p);

    let gone = fetcher.fetch(&url("/gone")).await.unwrap_err();
    assert!(matches!(gone, FetchError::Http { status: 404, .. }));
    assert_eq!(gone.kind(), FailureKind::Permanent);

    let busy = fetcher.fetch(&url("/busy")).await.unwrap_err();
    assert_eq!(busy.kind(), FailureKind::Transient);

    let throttled = fetcher.fetch(&url("/throttled")).await.unwrap_err();
    assert_eq!(throttled.kind(), FailureKind::Transient);

    let ok = fetcher.fetch(&url("/ok")).await.unwrap();
    assert_eq!(ok.status_code, 200);
    assert_eq!(ok.body, b"{}");
}

#[tokio::test]
async fn test_permanent_failure_retried_once_then_abandoned() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sync.db");
    let doc_url = format!("{}/doc?id=7", mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/doc"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&mock_server)
        .await;

    let mut config = test_config(&db_path, None);
    config.retry.backoff_base_secs = 0;
    config.retry.backoff_cap_secs = 0;

    let id = {
        let mut storage = SqliteStorage::new(&db_path).unwrap();
        storage
            .register_discovered(
                &NewImportRecord {
                    url: doc_url.clone(),
                    source_page_url: None,
                    anchor_text: Some("Proposal 7".to_string()),
                    url_pattern: doc_url.clone(),
                    family: "budget_proposal".to_string(),
                },
                Utc::now(),
            )
            .unwrap()
            .unwrap()
    };

    let summary = run_once(config).await;
    assert_eq!(summary.drain.failed, 2);

    let storage = SqliteStorage::new(&db_path).unwrap();
    let record = storage.get_import_record(id).unwrap();
    assert_eq!(record.status, ImportStatus::Abandoned);
    assert_eq!(record.error_count, 2);
    assert_eq!(record.last_error.unwrap().kind, FailureKind::Permanent);
}

#[tokio::test]
async fn test_schema_drift_parks_record() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sync.db");
    let listing_url = format!("{}/proposals", mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/proposals"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(TOKEN_A)))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"proposal_id": 42, "title": "Budget", "rapporteur": "Lovelace"}"#,
        ))
        .mount(&mock_server)
        .await;

    let summary = run_once(test_config(&db_path, Some(&listing_url))).await;
    assert_eq!(summary.drain.failed, 1);

    let mut storage = SqliteStorage::new(&db_path).unwrap();
    let parked = storage.get_records_by_status(ImportStatus::Error).unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].recrawl_count, 0);
    let error = parked[0].last_error.clone().unwrap();
    assert_eq!(error.kind, FailureKind::SchemaDrift);
    assert!(error.message.contains("rapporteur"));
    assert!(storage.count_domain_records().unwrap().is_empty());

    let reset = storage
        .reset_for_operator(&parked[0].url, Utc::now())
        .unwrap();
    assert_eq!(reset.status, ImportStatus::Discovered);
}

#[test]
fn test_concurrent_claims_single_winner() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sync.db");

    let id = {
        let mut storage = SqliteStorage::new(&db_path).unwrap();
        storage
            .register_discovered(
                &NewImportRecord {
                    url: "https://example.org/doc?id=1".to_string(),
                    source_page_url: None,
                    anchor_text: None,
                    url_pattern: "https://example.org/doc?id=1".to_string(),
                    family: "budget_proposal".to_string(),
                },
                Utc::now(),
            )
            .unwrap()
            .unwrap()
    };

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db_path = db_path.clone();
            std::thread::spawn(move || {
                let mut storage = SqliteStorage::new(&db_path).unwrap();
                storage.claim(id, Utc::now())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(result, Err(StorageError::AlreadyClaimed { .. })));
    }
}

fn versioned_proposal(version: u64) -> EntityGraph {
    let tagged = |extra: serde_json::Value| -> Fields {
        let mut fields = Fields::new();
        fields.insert("version".to_string(), version.into());
        if let serde_json::Value::Object(map) = extra {
            fields.extend(map);
        }
        fields
    };

    let children = (1..=3u64)
        .map(|n| {
            ChildRow::new("article", tagged(serde_json::json!({ "number": n })))
                .with_children(vec![ChildRow::new("item", tagged(serde_json::json!({})))])
        })
        .collect();

    EntityGraph::new(
        "budget_proposal",
        NaturalKey::single("proposal_id", "42"),
        tagged(serde_json::json!({ "title": format!("Version {}", version) })),
    )
    .with_children(children)
}

#[test]
fn test_concurrent_upserts_converge_on_one_record() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sync.db");
    SqliteStorage::new(&db_path).unwrap();

    let handles: Vec<_> = (0..8u64)
        .map(|version| {
            let db_path = db_path.clone();
            std::thread::spawn(move || {
                let mut storage = SqliteStorage::new(&db_path).unwrap();
                for _ in 0..5 {
                    storage
                        .upsert_entity(&versioned_proposal(version), Utc::now())
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let storage = SqliteStorage::new(&db_path).unwrap();
    assert_eq!(
        storage.count_domain_records().unwrap(),
        vec![("budget_proposal".to_string(), 1)]
    );

    let record = storage
        .get_domain_record("budget_proposal", &NaturalKey::single("proposal_id", "42"))
        .unwrap()
        .unwrap();
    let winner = record.fields["version"].clone();

    // Exactly one writer's child set, never a mix
    let children = storage.get_children(record.id).unwrap();
    assert_eq!(children.len(), 6);
    assert!(children.iter().all(|c| c.fields["version"] == winner));
    assert_eq!(children.iter().filter(|c| c.kind == "article").count(), 3);
    assert!(children
        .iter()
        .filter(|c| c.kind == "item")
        .all(|c| c.parent_id.is_some()));
}

#[tokio::test]
async fn test_legacy_duplicates_block_sync_until_dedup() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sync.db");

    SqliteStorage::new(&db_path).unwrap();
    rusqlite::Connection::open(&db_path)
        .unwrap()
        .execute_batch(
            "DROP INDEX idx_domain_records_natural_key;
             INSERT INTO domain_records (id, family, natural_key, fields, created_at, updated_at)
             VALUES (7, 'budget_proposal', 'proposal_id=42', '{\"title\":\"old\"}',
                     '2025-01-01T00:00:00.000000Z', '2025-01-01T00:00:00.000000Z');
             INSERT INTO domain_records (id, family, natural_key, fields, created_at, updated_at)
             VALUES (9, 'budget_proposal', 'proposal_id=42', '{\"title\":\"dup\"}',
                     '2025-02-01T00:00:00.000000Z', '2025-02-01T00:00:00.000000Z');",
        )
        .unwrap();

    let mut storage = SqliteStorage::new(&db_path).unwrap();
    assert!(!storage.has_natural_key_constraint().unwrap());

    let coordinator = Arc::new(Coordinator::new(test_config(&db_path, None)).unwrap());
    let (_tx, rx) = watch::channel(false);
    let blocked = coordinator.clone().run(RunMode::Once, rx.clone()).await;
    assert!(matches!(blocked, Err(SyncError::DedupRequired)));

    let report = storage.dedup_domain_records().unwrap();
    assert_eq!(report.removed_record_ids, vec![9]);
    assert!(report.constraint_added);

    // Reopening keeps the constraint
    let reopened = SqliteStorage::new(&db_path).unwrap();
    assert!(reopened.has_natural_key_constraint().unwrap());
    assert!(coordinator.run(RunMode::Once, rx).await.is_ok());
}

#[tokio::test]
async fn test_run_sync_records_run() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sync.db");

    let summary = run_sync(test_config(&db_path, None), "abc123", RunMode::Once)
        .await
        .unwrap();
    assert_eq!(summary.drain.imported, 0);

    let storage = SqliteStorage::new(&db_path).unwrap();
    let run = storage.get_latest_run().unwrap().expect("run recorded");
    assert_eq!(run.config_hash, "abc123");
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.finished_at.is_some());
}

#[test]
fn test_load_config_from_file() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("sync.db");
    let content = format!(
        r#"
[store]
database-path = "{}"

[retry]
max-retries = 3

[user-agent]
crawler-name = "TestBot"
crawler-version = "1.0.0"
contact-url = "https://example.com/contact"
contact-email = "test@example.com"

[[listing]]
url = "https://example.org/deputies"
family = "deputy"

[[mapping]]
family = "deputy"
natural-key = ["deputy_id"]
"#,
        db_path.display()
    );

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();

    let (config, hash) = load_config_with_hash(file.path()).unwrap();
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.retry.policy().max_retries, 3);
    assert_eq!(config.listing[0].family, "deputy");
    assert_eq!(hash.len(), 64);
}
