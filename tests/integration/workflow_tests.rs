//! Integration tests for the research workflow
//!
//! These tests use wiremock to serve sources over HTTP and an on-disk SQLite
//! database to run the workflow end-to-end through the public API.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use ripple_research::config::Config;
use ripple_research::crawler::{ContentFetcher, FetchError, FetchedContent, HttpFetcher};
use ripple_research::document::{ExportFormat, ExportService};
use ripple_research::storage::{open_storage, shared, SharedStorage, SqliteStorage};
use ripple_research::workflow::{
    ExtractiveDrafter, OutlineOptions, RunOutcome, WorkflowOrchestrator,
};
use ripple_research::{
    ResearchError, ResearchStatus, SectionStatus, SourceStatus, SourceType,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration with no crawl delay and fast retries
fn create_test_config(db_path: &str) -> Config {
    let mut config = Config::default();
    config.crawler.default_crawl_delay_ms = 0;
    config.crawler.fetch_timeout_ms = 5_000;
    config.telemetry.circuit_breaker_threshold = 3;
    config.telemetry.retry_backoff_ms = 10;
    config.telemetry.max_retry_backoff_ms = 40;
    config.workflow.sections_count = 3;
    config.output.database_path = db_path.to_string();
    config
}

fn http_orchestrator(config: Config, storage: SharedStorage) -> WorkflowOrchestrator {
    let fetcher = HttpFetcher::new(&config.user_agent, config.crawler.fetch_timeout())
        .expect("Failed to build HTTP client");
    WorkflowOrchestrator::new(
        storage,
        config,
        Arc::new(fetcher),
        Arc::new(ExtractiveDrafter::new()),
    )
}

fn html_page(title: &str, body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_string(format!(
            "<html><head><title>{}</title></head><body><p>{}</p></body></html>",
            title, body
        ))
        .insert_header("content-type", "text/html")
}

async fn mount_page(server: &MockServer, page: &str, title: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(page))
        .respond_with(html_page(title, body))
        .mount(server)
        .await;
}

async fn mount_robots(server: &MockServer, content: &str) {
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(content))
        .mount(server)
        .await;
}

async fn requests_to(server: &MockServer, page: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == page)
        .count()
}

#[tokio::test]
async fn test_full_workflow_over_http() {
    let server = MockServer::start().await;
    mount_robots(&server, "User-agent: *\nAllow: /").await;
    mount_page(
        &server,
        "/cover-crops",
        "Cover crops",
        "Cover crops increased soil carbon by 8% over five years. Soil structure improved.",
    )
    .await;
    mount_page(
        &server,
        "/tillage",
        "Tillage trials",
        "No-till plots stored more soil carbon than tilled plots. Tillage raised erosion.",
    )
    .await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("research.db");
    let db = db_path.to_str().unwrap();

    let research_id = {
        let orchestrator =
            http_orchestrator(create_test_config(db), open_storage(&db_path).unwrap());
        let research = orchestrator
            .create_research("Soil carbon", Some("farming practices"), "breadth")
            .unwrap();
        for page in ["/cover-crops", "/tillage"] {
            orchestrator
                .add_source(&research.id, &format!("{}{}", server.uri(), page), SourceType::Web)
                .unwrap();
        }

        let outcome = orchestrator.execute_workflow(&research.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        research.id
    };

    // Everything is persisted: reopen the database with a fresh orchestrator
    let orchestrator = http_orchestrator(create_test_config(db), open_storage(&db_path).unwrap());
    let status = orchestrator.get_workflow_status(&research_id).unwrap();
    assert_eq!(status.status, ResearchStatus::Complete);
    assert_eq!(status.failure, None);

    let sources = orchestrator.list_sources(&research_id).unwrap();
    assert!(sources.iter().all(|s| s.status == SourceStatus::Complete));
    assert_eq!(sources[0].title.as_deref(), Some("Cover crops"));

    let tree = orchestrator.sections().tree(&research_id).unwrap();
    assert_eq!(tree.len(), 3);
    assert!(tree
        .pre_order()
        .iter()
        .all(|(_, s)| s.status == SectionStatus::Complete && s.content.is_some()));

    let export = orchestrator
        .exports()
        .get_latest_by_format(&research_id, ExportFormat::Markdown)
        .unwrap()
        .expect("workflow should leave a markdown export");
    assert!(export.content.starts_with("# Soil carbon"));
    assert!(export.content.contains("## Introduction"));

    let stats = orchestrator
        .sources()
        .telemetry()
        .research_crawl_statistics(&research_id)
        .unwrap();
    assert_eq!(stats.total_sources, 2);
    assert_eq!(stats.completed_crawls, 2);
}

#[tokio::test]
async fn test_add_source_dedups_canonical_urls() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("research.db");
    let orchestrator = http_orchestrator(
        create_test_config(db_path.to_str().unwrap()),
        open_storage(&db_path).unwrap(),
    );
    let research = orchestrator.create_research("Dedup", None, "breadth").unwrap();

    let first = orchestrator
        .add_source(&research.id, "HTTPS://Example.com/paper?b=2&a=1#intro", SourceType::Web)
        .unwrap();
    let second = orchestrator
        .add_source(&research.id, "https://example.com/paper?a=1&b=2", SourceType::Pdf)
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(orchestrator.list_sources(&research.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_robots_disallow_fails_workflow() {
    let server = MockServer::start().await;
    mount_robots(&server, "User-agent: *\nDisallow: /private").await;
    mount_page(&server, "/private/notes", "Notes", "Hidden notes.").await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("research.db");
    let orchestrator = http_orchestrator(
        create_test_config(db_path.to_str().unwrap()),
        open_storage(&db_path).unwrap(),
    );
    let research = orchestrator.create_research("Private", None, "breadth").unwrap();
    let source = orchestrator
        .add_source(&research.id, &format!("{}/private/notes", server.uri()), SourceType::Web)
        .unwrap();

    let outcome = orchestrator.execute_workflow(&research.id).await.unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Failed { entity_id: Some(ref id), .. } if *id == source.id
    ));

    let stored = orchestrator.list_sources(&research.id).unwrap().remove(0);
    assert_eq!(stored.status, SourceStatus::Failed);
    assert!(stored.error_message.unwrap().contains("robots"));
    assert_eq!(requests_to(&server, "/private/notes").await, 0);
}

#[tokio::test]
async fn test_transient_errors_trip_circuit_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("research.db");
    let orchestrator = http_orchestrator(
        create_test_config(db_path.to_str().unwrap()),
        open_storage(&db_path).unwrap(),
    );
    let research = orchestrator.create_research("Flaky", None, "breadth").unwrap();
    orchestrator
        .add_source(&research.id, &format!("{}/flaky", server.uri()), SourceType::Web)
        .unwrap();

    let outcome = orchestrator.execute_workflow(&research.id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }));

    let source = orchestrator.list_sources(&research.id).unwrap().remove(0);
    assert_eq!(source.status, SourceStatus::Failed);
    assert_eq!(source.error_message.as_deref(), Some("HTTP 503"));
    assert!(source.metadata.error_tracking.circuit_broken);
    assert_eq!(source.metadata.error_tracking.consecutive_errors, 3);
    assert_eq!(source.metadata.error_tracking.total_error_count, 3);
    assert_eq!(requests_to(&server, "/flaky").await, 3);

    let status = orchestrator.get_workflow_status(&research.id).unwrap();
    assert_eq!(status.status, ResearchStatus::Failed);
    assert!(status.capabilities.can_resume);
}

#[tokio::test]
async fn test_outline_requires_complete_sources() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("research.db");
    let orchestrator = http_orchestrator(
        create_test_config(db_path.to_str().unwrap()),
        open_storage(&db_path).unwrap(),
    );
    let research = orchestrator.create_research("Early", None, "breadth").unwrap();
    orchestrator
        .add_source(&research.id, "https://example.com/pending", SourceType::Web)
        .unwrap();

    let result = orchestrator
        .generate_outline(
            &research.id,
            OutlineOptions {
                sections_count: 3,
                depth: 1,
            },
        )
        .await;
    assert!(matches!(result, Err(ResearchError::Precondition(_))));
    assert!(orchestrator.sections().tree(&research.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_skips_completed_work() {
    let server = MockServer::start().await;
    mount_robots(&server, "User-agent: *\nAllow: /").await;
    mount_page(&server, "/one", "One", "Soil carbon rose in the first trial.").await;
    mount_page(&server, "/two", "Two", "Soil carbon held steady in the second trial.").await;
    // The third source is missing on the first attempt only
    Mock::given(method("GET"))
        .and(path("/three"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_page(&server, "/three", "Three", "Soil carbon fell in the third trial.").await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("research.db");
    let orchestrator = http_orchestrator(
        create_test_config(db_path.to_str().unwrap()),
        open_storage(&db_path).unwrap(),
    );
    let research = orchestrator.create_research("Trials", None, "breadth").unwrap();
    let mut ids = Vec::new();
    for page in ["/one", "/two", "/three"] {
        let source = orchestrator
            .add_source(&research.id, &format!("{}{}", server.uri(), page), SourceType::Web)
            .unwrap();
        ids.push(source.id);
    }

    let outcome = orchestrator.execute_workflow(&research.id).await.unwrap();
    match outcome {
        RunOutcome::Failed { entity_id, .. } => assert_eq!(entity_id, Some(ids[2].clone())),
        other => panic!("expected a failed run, got {:?}", other),
    }

    let outcome = orchestrator.resume_workflow(&research.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    assert_eq!(requests_to(&server, "/one").await, 1);
    assert_eq!(requests_to(&server, "/two").await, 1);
    assert_eq!(requests_to(&server, "/three").await, 2);

    // A completed record is not resumed again
    let outcome = orchestrator.resume_workflow(&research.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::NotStarted(ResearchStatus::Complete));
}

#[tokio::test]
async fn test_export_expiry() {
    let server = MockServer::start().await;
    mount_robots(&server, "User-agent: *\nAllow: /").await;
    mount_page(&server, "/report", "Report", "Soil carbon is a slow variable.").await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("research.db");
    let storage = open_storage(&db_path).unwrap();
    let orchestrator =
        http_orchestrator(create_test_config(db_path.to_str().unwrap()), storage.clone());
    let research = orchestrator.create_research("Expiry", None, "breadth").unwrap();
    orchestrator
        .add_source(&research.id, &format!("{}/report", server.uri()), SourceType::Web)
        .unwrap();
    orchestrator.execute_workflow(&research.id).await.unwrap();

    let exports = ExportService::new(storage, Some(ChronoDuration::hours(1)));
    let export = exports.create_export(&research.id, ExportFormat::Html).unwrap();
    assert_eq!(exports.increment_download_count(&export.id).unwrap(), 1);
    assert!(exports
        .get_latest_by_format(&research.id, ExportFormat::Html)
        .unwrap()
        .is_some());

    // The workflow's own export uses the week-long default and survives
    let removed = exports.delete_expired(Utc::now() + ChronoDuration::hours(2)).unwrap();
    assert_eq!(removed, 1);
    assert!(exports
        .get_latest_by_format(&research.id, ExportFormat::Html)
        .unwrap()
        .is_none());
    assert!(exports
        .get_latest_by_format(&research.id, ExportFormat::Markdown)
        .unwrap()
        .is_some());
}

/// Fetcher that records when each request, robots.txt included, started
#[derive(Default)]
struct RecordingFetcher {
    started: Mutex<Vec<(String, Instant)>>,
}

#[async_trait]
impl ContentFetcher for RecordingFetcher {
    async fn fetch(&self, url: &Url, _source_type: SourceType) -> Result<FetchedContent, FetchError> {
        self.started
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(FetchedContent {
            http_status: 200,
            final_url: url.to_string(),
            title: Some(url.path().to_string()),
            extracted_text: format!("Soil carbon notes from {}. Cover crops help.", url.path()),
            links: Vec::new(),
        })
    }

    async fn fetch_robots(&self, robots_url: &Url) -> Result<Option<String>, FetchError> {
        self.started
            .lock()
            .unwrap()
            .push((robots_url.to_string(), Instant::now()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(None)
    }
}

#[tokio::test(start_paused = true)]
async fn test_politeness_spacing() {
    let storage = shared(SqliteStorage::new_in_memory().unwrap());
    let mut config = create_test_config(":memory:");
    config.crawler.default_crawl_delay_ms = 1_000;
    config.crawler.max_concurrent_fetches = 4;

    let fetcher = Arc::new(RecordingFetcher::default());
    let orchestrator = WorkflowOrchestrator::new(
        storage,
        config,
        fetcher.clone(),
        Arc::new(ExtractiveDrafter::new()),
    );
    let research = orchestrator.create_research("Spacing", None, "breadth").unwrap();
    for page in ["a", "b", "c"] {
        orchestrator
            .add_source(&research.id, &format!("https://slow.example.com/{}", page), SourceType::Web)
            .unwrap();
    }
    orchestrator
        .add_source(&research.id, "https://other.example.org/x", SourceType::Web)
        .unwrap();

    let outcome = orchestrator.execute_workflow(&research.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let started = fetcher.started.lock().unwrap().clone();
    // One robots.txt per domain plus four pages
    assert_eq!(started.len(), 6);

    let mut by_domain: HashMap<String, Vec<(Instant, bool)>> = HashMap::new();
    for (url, at) in started {
        let parsed = Url::parse(&url).unwrap();
        let domain = parsed.host_str().unwrap().to_string();
        by_domain
            .entry(domain)
            .or_default()
            .push((at, parsed.path() == "/robots.txt"));
    }

    // robots.txt counts as a fetch: every request to the domain is spaced
    let mut slow = by_domain["slow.example.com"].clone();
    slow.sort();
    assert_eq!(slow.len(), 4);
    assert!(slow[0].1, "robots.txt is fetched first");
    for pair in slow.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(1_000));
    }

    // Another domain is not held back by the slow one
    let other_page = by_domain["other.example.org"]
        .iter()
        .find(|(_, robots)| !robots)
        .unwrap()
        .0;
    let first_slow_page = slow[1].0;
    assert!(other_page < first_slow_page + Duration::from_millis(1_000));
}
