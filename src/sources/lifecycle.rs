use crate::config::{Config, TelemetryConfig};
use crate::crawler::{Admission, ContentFetcher, Disposition, DomainGovernor, FetchError, FetchedContent};
use crate::sources::extract::{estimate_tokens, process_content};
use crate::state::{CrawlStatus, SourceStatus, SourceType, UrlStatus};
use crate::storage::{
    lock, new_id, timestamp_now, CrawledContentRecord, SharedStorage, SourceRecord, StorageError,
    UrlRecord,
};
use crate::telemetry::{CrawlTelemetry, PerformanceUpdate, ProgressPatch};
use crate::url::{extract_domain, parse_source_url, url_hash};
use crate::{ResearchError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Depth recorded for links found directly on a source
const SOURCE_LINK_DEPTH: u32 = 1;

/// What one `process_source` call did
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed,
    /// Unrecoverable failure, or the circuit breaker opened
    Failed(String),
    /// Politeness gate refused; the source is still pending
    Deferred(Duration),
    /// Transient failure; the source is back to pending
    Retry { after: Duration },
    /// The source was not pending
    Skipped(SourceStatus),
}

impl ProcessOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Completed => Disposition::Completed,
            Self::Failed(_) => Disposition::Failed,
            Self::Deferred(wait) => Disposition::Requeue(*wait),
            Self::Retry { after } => Disposition::Requeue(*after),
            Self::Skipped(_) => Disposition::Skipped,
        }
    }
}

/// Drives sources through `pending -> processing -> {complete, failed}`
#[derive(Clone)]
pub struct SourceManager {
    storage: SharedStorage,
    fetcher: Arc<dyn ContentFetcher>,
    governor: DomainGovernor,
    telemetry: CrawlTelemetry,
    backoff: TelemetryConfig,
    fetch_timeout: Duration,
    recrawl_ttl: chrono::Duration,
    session_id: String,
}

impl SourceManager {
    /// Creates a manager; every manager is one crawl session
    pub fn new(storage: SharedStorage, fetcher: Arc<dyn ContentFetcher>, config: &Config) -> Self {
        let governor = DomainGovernor::new(
            storage.clone(),
            config.crawler.default_crawl_delay_ms,
            config.crawler.respect_robots,
            &config.user_agent.header_value(),
        );
        let telemetry = CrawlTelemetry::new(
            storage.clone(),
            config.telemetry.circuit_breaker_threshold,
        );

        Self {
            storage,
            fetcher,
            governor,
            telemetry,
            backoff: config.telemetry.clone(),
            fetch_timeout: config.crawler.fetch_timeout(),
            recrawl_ttl: config.crawler.recrawl_ttl(),
            session_id: new_id(),
        }
    }

    pub fn governor(&self) -> &DomainGovernor {
        &self.governor
    }

    pub fn telemetry(&self) -> &CrawlTelemetry {
        &self.telemetry
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Adds a source to a research record
    ///
    /// Adding a URL whose canonical form is already a source of the record
    /// returns the existing source unchanged.
    ///
    /// # Returns
    ///
    /// * `Ok(SourceRecord)` - The new or existing source
    /// * `Err(ResearchError::Url)` - The URL is not an absolute http(s) URL
    /// * `Err(ResearchError::NotFound)` - The research record does not exist
    pub fn add_source(
        &self,
        research_id: &str,
        raw_url: &str,
        source_type: SourceType,
    ) -> Result<SourceRecord> {
        let url = parse_source_url(raw_url)?;
        let hash = url_hash(url.as_str());
        let domain = extract_domain(&url).unwrap_or_default();

        let mut storage = lock(&self.storage)?;
        if storage.get_research(research_id)?.is_none() {
            return Err(ResearchError::not_found("research", research_id));
        }

        if let Some(existing) = storage.find_source_by_hash(research_id, &hash)? {
            debug!("Source {} already present as {}", url, existing.id);
            return Ok(existing);
        }

        let source = SourceRecord::new(research_id, url.as_str(), &hash, source_type);
        match storage.insert_source(&source) {
            Ok(()) => {}
            Err(StorageError::ConstraintViolation(_)) => {
                if let Some(existing) = storage.find_source_by_hash(research_id, &hash)? {
                    return Ok(existing);
                }
            }
            Err(e) => return Err(e.into()),
        }

        if storage.get_url(&hash)?.is_none() {
            storage.upsert_url(&UrlRecord {
                url_hash: hash.clone(),
                domain: domain.clone(),
                raw_url: url.to_string(),
                status: UrlStatus::Pending,
                http_status: None,
                crawl_session_id: None,
                last_crawled_at: None,
            })?;
        }

        drop(storage);
        self.governor.discover(&domain)?;
        info!("Added {} source {} to research {}", source_type, url, research_id);
        Ok(source)
    }

    /// Ids of the pending sources of a research record, in creation order
    pub fn pending_source_ids(&self, research_id: &str) -> Result<Vec<String>> {
        Ok(lock(&self.storage)?
            .list_sources(research_id)?
            .into_iter()
            .filter(|s| s.status == SourceStatus::Pending)
            .map(|s| s.id)
            .collect())
    }

    /// Runs one processing attempt for a source
    ///
    /// Fetch and extraction failures are folded into the outcome and the
    /// source's state; only storage problems and unknown ids are errors.
    pub async fn process_source(&self, source_id: &str) -> Result<ProcessOutcome> {
        let source = self.load(source_id)?;
        if source.status != SourceStatus::Pending {
            return Ok(ProcessOutcome::Skipped(source.status));
        }

        let url = match Url::parse(&source.url) {
            Ok(url) => url,
            Err(e) => {
                let error = FetchError::Parse(format!("stored URL is invalid: {}", e));
                return self.claim_and_fail(&source, error);
            }
        };

        if let Some(cached) = self.fresh_content(&source)? {
            if !self.claim(source_id)? {
                return Ok(ProcessOutcome::Skipped(self.load(source_id)?.status));
            }
            debug!("Reusing crawled content for {}", source.url);
            return self.complete(&source, cached, None);
        }

        let domain = extract_domain(&url).unwrap_or_default();
        if !self.governor.needs_robots(&domain)? && !self.governor.is_allowed(&url)? {
            info!("URL {} disallowed by robots.txt", url);
            return self.claim_and_fail(&source, FetchError::ForbiddenByRobots);
        }

        let permit = match self.governor.try_acquire(&domain)? {
            Admission::Granted(permit) => permit,
            Admission::Deferred(wait) => return Ok(self.defer(&source, &domain, wait)),
        };

        if self.governor.needs_robots(&domain)? {
            let delay = self
                .governor
                .refresh_robots(&permit, &url, self.fetcher.as_ref())
                .await?;
            if !delay.is_zero() {
                // The robots request used this slot; the page waits a full delay
                drop(permit);
                return Ok(self.defer(&source, &domain, delay));
            }
        }

        if !self.governor.is_allowed(&url)? {
            drop(permit);
            info!("URL {} disallowed by robots.txt", url);
            return self.claim_and_fail(&source, FetchError::ForbiddenByRobots);
        }

        if !self.claim(source_id)? {
            return Ok(ProcessOutcome::Skipped(self.load(source_id)?.status));
        }

        self.governor.start_fetch(&permit);
        let started = Instant::now();
        let fetched = match tokio::time::timeout(
            self.fetch_timeout,
            self.fetcher.fetch(&url, source.source_type),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        };
        drop(permit);
        let duration_ms = started.elapsed().as_millis() as u64;

        match fetched {
            Ok(content) => self.complete(&source, content, Some(duration_ms)),
            Err(error) => self.handle_failure(&source, error, Some(duration_ms)),
        }
    }

    /// Moves a failed source back to `pending`; returns false for any other status
    pub fn retry(&self, source_id: &str) -> Result<bool> {
        let now = timestamp_now();
        let mut changed = false;
        let source = lock(&self.storage)?
            .modify_source(source_id, &mut |source| {
                if source.status != SourceStatus::Failed {
                    return false;
                }
                source.status = SourceStatus::Pending;
                source.error_message = None;
                source.metadata.reset_for_retry();
                source.metadata.touch(now);
                changed = true;
                true
            })?
            .ok_or_else(|| ResearchError::not_found("source", source_id))?;

        if changed {
            self.reset_url(&source.url_hash)?;
            info!("Source {} re-queued for retry", source_id);
        }
        Ok(changed)
    }

    /// Returns sources stranded in `processing` (by a crash or a killed run) to `pending`
    pub fn recover_interrupted(&self, research_id: &str) -> Result<usize> {
        let now = timestamp_now();
        let mut storage = lock(&self.storage)?;
        let stranded: Vec<String> = storage
            .list_sources(research_id)?
            .into_iter()
            .filter(|s| s.status == SourceStatus::Processing)
            .map(|s| s.id)
            .collect();

        let mut recovered = 0;
        for id in stranded {
            let mut changed = false;
            storage.modify_source(&id, &mut |source| {
                if source.status != SourceStatus::Processing {
                    return false;
                }
                source.status = SourceStatus::Pending;
                source.metadata.crawl_status = CrawlStatus::Queued;
                source.metadata.touch(now);
                changed = true;
                true
            })?;
            if changed {
                recovered += 1;
            }
        }

        if recovered > 0 {
            warn!("Recovered {} interrupted sources for research {}", recovered, research_id);
        }
        Ok(recovered)
    }

    fn defer(&self, source: &SourceRecord, domain: &str, wait: Duration) -> ProcessOutcome {
        debug!("Deferring {} for {:?} (domain {})", source.url, wait, domain);
        self.note(
            &source.id,
            self.telemetry
                .set_crawl_status(&source.id, CrawlStatus::Queued, None),
        );
        ProcessOutcome::Deferred(wait)
    }

    fn load(&self, source_id: &str) -> Result<SourceRecord> {
        lock(&self.storage)?
            .get_source(source_id)?
            .ok_or_else(|| ResearchError::not_found("source", source_id))
    }

    /// Conditional `pending -> processing`; false when another worker won
    fn claim(&self, source_id: &str) -> Result<bool> {
        let now = timestamp_now();
        let session = self.session_id.clone();
        let mut claimed = false;
        lock(&self.storage)?.modify_source(source_id, &mut |source| {
            if source.status != SourceStatus::Pending {
                return false;
            }
            source.status = SourceStatus::Processing;
            source.metadata.crawl_status = CrawlStatus::Active;
            source.metadata.crawl_session_id = Some(session.clone());
            if source.metadata.crawl_progress.started_at.is_none() {
                source.metadata.crawl_progress.started_at = Some(now);
            }
            source.metadata.touch(now);
            claimed = true;
            true
        })?;
        Ok(claimed)
    }

    fn claim_and_fail(&self, source: &SourceRecord, error: FetchError) -> Result<ProcessOutcome> {
        if !self.claim(&source.id)? {
            return Ok(ProcessOutcome::Skipped(self.load(&source.id)?.status));
        }
        self.handle_failure(source, error, None)
    }

    /// Crawled content for the source's URL still inside the re-crawl TTL
    fn fresh_content(&self, source: &SourceRecord) -> Result<Option<FetchedContent>> {
        let mut storage = lock(&self.storage)?;
        let Some(url_record) = storage.get_url(&source.url_hash)? else {
            return Ok(None);
        };
        if url_record.status != UrlStatus::Crawled {
            return Ok(None);
        }

        let fresh = url_record
            .last_crawled_at
            .map_or(false, |at| timestamp_now() - at < self.recrawl_ttl);
        if !fresh {
            // Expired: the URL goes back to pending and is fetched again
            storage.upsert_url(&UrlRecord {
                status: UrlStatus::Pending,
                ..url_record
            })?;
            return Ok(None);
        }

        Ok(storage
            .get_crawled_content(&source.url_hash)?
            .map(|content| FetchedContent {
                http_status: url_record.http_status.unwrap_or(200),
                final_url: source.url.clone(),
                title: content.title,
                extracted_text: content.extracted_text,
                links: content.links,
            }))
    }

    fn complete(
        &self,
        source: &SourceRecord,
        content: FetchedContent,
        duration_ms: Option<u64>,
    ) -> Result<ProcessOutcome> {
        let now = timestamp_now();
        let tokens = estimate_tokens(&content.extracted_text);
        let domain = Url::parse(&source.url)
            .ok()
            .and_then(|u| extract_domain(&u))
            .unwrap_or_default();

        let updated = {
            let mut storage = lock(&self.storage)?;

            storage.upsert_crawled_content(&CrawledContentRecord {
                url_hash: source.url_hash.clone(),
                title: content.title.clone(),
                extracted_text: content.extracted_text.clone(),
                links: content.links.clone(),
                crawled_at: now,
                crawl_session_id: Some(self.session_id.clone()),
                research_source_id: Some(source.id.clone()),
            })?;
            storage.upsert_url(&UrlRecord {
                url_hash: source.url_hash.clone(),
                domain,
                raw_url: source.url.clone(),
                status: UrlStatus::Crawled,
                http_status: Some(content.http_status),
                crawl_session_id: Some(self.session_id.clone()),
                last_crawled_at: Some(now),
            })?;
            storage.replace_processed_data(&process_content(
                &source.id,
                &source.research_id,
                &content.extracted_text,
            ))?;

            let title = content.title.clone();
            storage
                .modify_source(&source.id, &mut |record| {
                    if record.status != SourceStatus::Processing {
                        return false;
                    }
                    record.status = SourceStatus::Complete;
                    record.error_message = None;
                    record.token_count = Some(tokens);
                    if title.is_some() {
                        record.title = title.clone();
                    }
                    true
                })?
                .ok_or_else(|| ResearchError::not_found("source", &source.id))?
        };

        if updated.status != SourceStatus::Complete {
            return Ok(ProcessOutcome::Skipped(updated.status));
        }

        let pages = updated.metadata.crawl_progress.total_pages_crawled + 1;
        let links = content
            .links
            .iter()
            .map(|link| (link.clone(), SOURCE_LINK_DEPTH))
            .collect();

        self.note(&source.id, self.telemetry.clear_errors(&source.id));
        self.note(&source.id, self.telemetry.batch_add_discovered_links(&source.id, links));
        self.note(
            &source.id,
            self.telemetry.update_crawl_progress(
                &source.id,
                ProgressPatch {
                    total_pages_crawled: Some(pages),
                    estimated_time_remaining_ms: Some(0),
                    completed_at: Some(now),
                    ..ProgressPatch::default()
                },
            ),
        );
        self.note(
            &source.id,
            self.telemetry.update_performance_stats(
                &source.id,
                PerformanceUpdate {
                    succeeded: true,
                    tokens,
                    duration_ms,
                },
            ),
        );
        self.note(
            &source.id,
            self.telemetry
                .set_crawl_status(&source.id, CrawlStatus::Completed, None),
        );

        info!("Source {} complete ({} tokens, {} links)", source.url, tokens, content.links.len());
        Ok(ProcessOutcome::Completed)
    }

    fn handle_failure(
        &self,
        source: &SourceRecord,
        error: FetchError,
        duration_ms: Option<u64>,
    ) -> Result<ProcessOutcome> {
        let message = error.to_string();
        self.note(
            &source.id,
            self.telemetry.update_performance_stats(
                &source.id,
                PerformanceUpdate {
                    succeeded: false,
                    tokens: 0,
                    duration_ms,
                },
            ),
        );

        if error.is_transient() {
            let outcome = self.note(
                &source.id,
                self.telemetry
                    .track_error(&source.id, error.error_type(), &message),
            );

            if outcome.map_or(false, |o| o.circuit_broken) {
                self.mark_url_failed(source, error.http_status())?;
                return Ok(ProcessOutcome::Failed(message));
            }

            let now = timestamp_now();
            lock(&self.storage)?.modify_source(&source.id, &mut |record| {
                if !(record.status == SourceStatus::Processing
                    && record.status.can_transition_to(SourceStatus::Pending))
                {
                    return false;
                }
                record.status = SourceStatus::Pending;
                record.metadata.crawl_status = CrawlStatus::Queued;
                record.metadata.touch(now);
                true
            })?;

            let consecutive = outcome.map_or(1, |o| o.consecutive_errors);
            let after = self.backoff.backoff_for(consecutive);
            warn!(
                "Transient failure for {} ({}), retrying in {:?}",
                source.url, message, after
            );
            return Ok(ProcessOutcome::Retry { after });
        }

        let failure = message.clone();
        lock(&self.storage)?.modify_source(&source.id, &mut |record| {
            if !record.status.can_transition_to(SourceStatus::Failed) {
                return false;
            }
            record.status = SourceStatus::Failed;
            record.error_message = Some(failure.clone());
            true
        })?;
        self.note(
            &source.id,
            self.telemetry
                .track_error(&source.id, error.error_type(), &message),
        );
        self.note(
            &source.id,
            self.telemetry
                .set_crawl_status(&source.id, CrawlStatus::Failed, None),
        );
        self.mark_url_failed(source, error.http_status())?;

        warn!("Source {} failed: {}", source.url, message);
        Ok(ProcessOutcome::Failed(message))
    }

    fn mark_url_failed(&self, source: &SourceRecord, http_status: Option<u16>) -> Result<()> {
        let mut storage = lock(&self.storage)?;
        if let Some(record) = storage.get_url(&source.url_hash)? {
            storage.upsert_url(&UrlRecord {
                status: UrlStatus::Failed,
                http_status: http_status.or(record.http_status),
                crawl_session_id: Some(self.session_id.clone()),
                ..record
            })?;
        }
        Ok(())
    }

    fn reset_url(&self, url_hash: &str) -> Result<()> {
        let mut storage = lock(&self.storage)?;
        if let Some(record) = storage.get_url(url_hash)? {
            if record.status == UrlStatus::Failed {
                storage.upsert_url(&UrlRecord {
                    status: UrlStatus::Pending,
                    ..record
                })?;
            }
        }
        Ok(())
    }

    /// Telemetry never fails the primary transition
    fn note<T>(&self, source_id: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Telemetry update for source {} failed: {}", source_id, e);
                None
            }
        }
    }
}
