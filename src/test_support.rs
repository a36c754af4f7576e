//! Shared fixtures for unit tests

use crate::config::Config;
use crate::crawler::{ContentFetcher, FetchError, FetchedContent};
use crate::state::SourceType;
use crate::document::ExportFormat;
use crate::state::DomainRecord;
use crate::storage::{
    lock, shared, CrawledContentRecord, ExportRecord, ProcessedDataRecord, ResearchRecord,
    SectionRecord, SharedStorage, SourceRecord, SqliteStorage, Storage, StorageError,
    StorageResult, UrlRecord,
};
use chrono::{DateTime, Utc};
use crate::workflow::{DraftError, DraftedSection, Drafter, OutlineNode, SectionBrief, SourceDigest};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

pub(crate) fn test_storage() -> SharedStorage {
    shared(SqliteStorage::new_in_memory().unwrap())
}

/// Config with no crawl delay and a small circuit breaker threshold
pub(crate) fn create_test_config() -> Config {
    let mut config = Config::default();
    config.crawler.default_crawl_delay_ms = 0;
    config.crawler.fetch_timeout_ms = 5_000;
    config.telemetry.circuit_breaker_threshold = 3;
    config.telemetry.retry_backoff_ms = 10;
    config.telemetry.max_retry_backoff_ms = 40;
    config.workflow.draft_timeout_ms = 5_000;
    config
}

pub(crate) fn seed_research(storage: &SharedStorage) -> ResearchRecord {
    let record = ResearchRecord::new("Regenerative agriculture", Some("soil outcomes"), "breadth");
    lock(storage).unwrap().insert_research(&record).unwrap();
    record
}

pub(crate) fn page(url: &str, title: &str, text: &str, links: &[&str]) -> FetchedContent {
    FetchedContent {
        http_status: 200,
        final_url: url.to_string(),
        title: Some(title.to_string()),
        extracted_text: text.to_string(),
        links: links.iter().map(|l| l.to_string()).collect(),
    }
}

/// In-memory storage that rejects every source write leaving the status unchanged
///
/// Status transitions (claims, completion, failure) go through; telemetry
/// writes, which only touch the metadata blob, fail.
pub(crate) struct TelemetryFailingStorage {
    inner: SqliteStorage,
}

pub(crate) fn telemetry_failing_storage() -> SharedStorage {
    shared(TelemetryFailingStorage {
        inner: SqliteStorage::new_in_memory().unwrap(),
    })
}

impl Storage for TelemetryFailingStorage {
    fn insert_research(&mut self, record: &ResearchRecord) -> StorageResult<()> {
        self.inner.insert_research(record)
    }

    fn get_research(&self, id: &str) -> StorageResult<Option<ResearchRecord>> {
        self.inner.get_research(id)
    }

    fn list_research(&self) -> StorageResult<Vec<ResearchRecord>> {
        self.inner.list_research()
    }

    fn modify_research(
        &mut self,
        id: &str,
        apply: &mut dyn FnMut(&mut ResearchRecord) -> bool,
    ) -> StorageResult<Option<ResearchRecord>> {
        self.inner.modify_research(id, apply)
    }

    fn insert_source(&mut self, source: &SourceRecord) -> StorageResult<()> {
        self.inner.insert_source(source)
    }

    fn get_source(&self, id: &str) -> StorageResult<Option<SourceRecord>> {
        self.inner.get_source(id)
    }

    fn find_source_by_hash(
        &self,
        research_id: &str,
        url_hash: &str,
    ) -> StorageResult<Option<SourceRecord>> {
        self.inner.find_source_by_hash(research_id, url_hash)
    }

    fn list_sources(&self, research_id: &str) -> StorageResult<Vec<SourceRecord>> {
        self.inner.list_sources(research_id)
    }

    fn modify_source(
        &mut self,
        id: &str,
        apply: &mut dyn FnMut(&mut SourceRecord) -> bool,
    ) -> StorageResult<Option<SourceRecord>> {
        let mut transitioned = false;
        let result = self.inner.modify_source(id, &mut |record| {
            let before = record.status;
            let changed = apply(record);
            transitioned = changed && record.status != before;
            transitioned
        })?;
        if transitioned {
            Ok(result)
        } else {
            Err(StorageError::ConstraintViolation(format!(
                "metadata write rejected for source {}",
                id
            )))
        }
    }

    fn upsert_domain(&mut self, domain: &DomainRecord) -> StorageResult<()> {
        self.inner.upsert_domain(domain)
    }

    fn get_domain(&self, domain: &str) -> StorageResult<Option<DomainRecord>> {
        self.inner.get_domain(domain)
    }

    fn upsert_url(&mut self, url: &UrlRecord) -> StorageResult<()> {
        self.inner.upsert_url(url)
    }

    fn get_url(&self, url_hash: &str) -> StorageResult<Option<UrlRecord>> {
        self.inner.get_url(url_hash)
    }

    fn upsert_crawled_content(&mut self, content: &CrawledContentRecord) -> StorageResult<()> {
        self.inner.upsert_crawled_content(content)
    }

    fn get_crawled_content(&self, url_hash: &str) -> StorageResult<Option<CrawledContentRecord>> {
        self.inner.get_crawled_content(url_hash)
    }

    fn replace_processed_data(&mut self, data: &ProcessedDataRecord) -> StorageResult<()> {
        self.inner.replace_processed_data(data)
    }

    fn get_processed_data(&self, source_id: &str) -> StorageResult<Option<ProcessedDataRecord>> {
        self.inner.get_processed_data(source_id)
    }

    fn list_processed_data(&self, research_id: &str) -> StorageResult<Vec<ProcessedDataRecord>> {
        self.inner.list_processed_data(research_id)
    }

    fn insert_sections(&mut self, sections: &[SectionRecord]) -> StorageResult<()> {
        self.inner.insert_sections(sections)
    }

    fn get_section(&self, id: &str) -> StorageResult<Option<SectionRecord>> {
        self.inner.get_section(id)
    }

    fn list_sections(&self, research_id: &str) -> StorageResult<Vec<SectionRecord>> {
        self.inner.list_sections(research_id)
    }

    fn modify_section(
        &mut self,
        id: &str,
        apply: &mut dyn FnMut(&mut SectionRecord) -> bool,
    ) -> StorageResult<Option<SectionRecord>> {
        self.inner.modify_section(id, apply)
    }

    fn reorder_sections(&mut self, updates: &[(String, i64)]) -> StorageResult<()> {
        self.inner.reorder_sections(updates)
    }

    fn insert_export(&mut self, export: &ExportRecord) -> StorageResult<()> {
        self.inner.insert_export(export)
    }

    fn get_export(&self, id: &str) -> StorageResult<Option<ExportRecord>> {
        self.inner.get_export(id)
    }

    fn latest_export_by_format(
        &self,
        research_id: &str,
        format: ExportFormat,
    ) -> StorageResult<Option<ExportRecord>> {
        self.inner.latest_export_by_format(research_id, format)
    }

    fn list_exports(&self, research_id: &str) -> StorageResult<Vec<ExportRecord>> {
        self.inner.list_exports(research_id)
    }

    fn increment_download_count(&mut self, id: &str) -> StorageResult<Option<u64>> {
        self.inner.increment_download_count(id)
    }

    fn delete_expired_exports(&mut self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.inner.delete_expired_exports(now)
    }
}

type Scripted = Result<FetchedContent, FetchError>;

/// Fetcher answering from per-URL scripts
///
/// Each URL has a queue of responses; the last one repeats. Unknown URLs
/// answer HTTP 404.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    robots: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, url: &str, response: Scripted) {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub(crate) fn respond_page(&self, url: &str, title: &str, text: &str, links: &[&str]) {
        self.respond(url, Ok(page(url, title, text, links)));
    }

    pub(crate) fn robots(&self, robots_url: &str, content: &str) {
        self.robots
            .lock()
            .unwrap()
            .insert(robots_url.to_string(), content.to_string());
    }

    pub(crate) fn delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &Url, _source_type: SourceType) -> Result<FetchedContent, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(url.as_str()) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => Err(FetchError::HttpStatus { status: 404 }),
        }
    }

    async fn fetch_robots(&self, robots_url: &Url) -> Result<Option<String>, FetchError> {
        Ok(self.robots.lock().unwrap().get(robots_url.as_str()).cloned())
    }
}

/// Drafter that fails for section titles containing a marker
#[derive(Default)]
pub(crate) struct ScriptedDrafter {
    pub(crate) fail_marker: Mutex<Option<String>>,
    pub(crate) drafted: Mutex<Vec<String>>,
    pub(crate) outlines: Mutex<usize>,
}

impl ScriptedDrafter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_on(&self, marker: &str) {
        *self.fail_marker.lock().unwrap() = Some(marker.to_string());
    }

    pub(crate) fn clear_failures(&self) {
        *self.fail_marker.lock().unwrap() = None;
    }
}

#[async_trait]
impl Drafter for ScriptedDrafter {
    async fn generate_outline(
        &self,
        _topic: &str,
        _sources: &[SourceDigest],
        sections_count: u32,
        depth: u32,
    ) -> Result<Vec<OutlineNode>, DraftError> {
        *self.outlines.lock().unwrap() += 1;
        Ok((1..=sections_count)
            .map(|i| OutlineNode {
                title: format!("Part {}", i),
                description: None,
                children: if depth > 1 {
                    vec![OutlineNode {
                        title: format!("Part {}.1", i),
                        description: None,
                        children: Vec::new(),
                    }]
                } else {
                    Vec::new()
                },
            })
            .collect())
    }

    async fn draft_section(
        &self,
        section: &SectionBrief,
        _sources: &[SourceDigest],
    ) -> Result<DraftedSection, DraftError> {
        let marker = self.fail_marker.lock().unwrap().clone();
        if let Some(marker) = marker {
            if section.title.contains(&marker) {
                return Err(DraftError::Failed(format!("scripted failure for {}", section.title)));
            }
        }
        self.drafted.lock().unwrap().push(section.title.clone());
        Ok(DraftedSection::from_content(format!("Body of {}.", section.title)))
    }
}
