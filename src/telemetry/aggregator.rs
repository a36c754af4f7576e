use crate::state::{CrawlStatus, SourceStatus};
use crate::storage::{lock, timestamp_now, SharedStorage, SourceRecord};
use crate::telemetry::metadata::{
    CrawlProgress, ErrorTracking, PerformanceStats, PerformanceUpdate, ProgressPatch,
    SourceMetadata,
};
use crate::telemetry::stats::ResearchCrawlStatistics;
use crate::{ResearchError, Result};
use tracing::{debug, warn};

/// Result of recording one error against a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorOutcome {
    pub consecutive_errors: u32,
    /// True when this error opened the circuit breaker
    pub circuit_tripped: bool,
    /// True when the breaker is open (now or from an earlier error)
    pub circuit_broken: bool,
}

/// Read-only view of one source's crawl progress
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProgress {
    pub source_id: String,
    pub status: SourceStatus,
    pub crawl_status: CrawlStatus,
    pub progress: CrawlProgress,
    pub errors: ErrorTracking,
    pub performance: PerformanceStats,
    pub discovery_rate_per_minute: f64,
}

/// Atomic updates to the crawl telemetry stored on sources
///
/// Every write is a read-modify-write of one source row inside a storage
/// transaction, so concurrent workers never lose each other's updates.
#[derive(Clone)]
pub struct CrawlTelemetry {
    storage: SharedStorage,
    circuit_breaker_threshold: u32,
}

impl CrawlTelemetry {
    pub fn new(storage: SharedStorage, circuit_breaker_threshold: u32) -> Self {
        Self {
            storage,
            circuit_breaker_threshold: circuit_breaker_threshold.max(1),
        }
    }

    fn modify<F>(&self, source_id: &str, mut apply: F) -> Result<SourceRecord>
    where
        F: FnMut(&mut SourceRecord),
    {
        let now = timestamp_now();
        let mut storage = lock(&self.storage)?;
        storage
            .modify_source(source_id, &mut |source| {
                apply(source);
                source.metadata.touch(now);
                true
            })?
            .ok_or_else(|| ResearchError::not_found("source", source_id))
    }

    pub fn set_crawl_status(
        &self,
        source_id: &str,
        status: CrawlStatus,
        session_id: Option<&str>,
    ) -> Result<SourceMetadata> {
        let source = self.modify(source_id, |source| {
            source.metadata.crawl_status = status;
            if let Some(session) = session_id {
                source.metadata.crawl_session_id = Some(session.to_string());
            }
        })?;
        Ok(source.metadata)
    }

    /// Merges a partial progress update; absent fields keep their values
    pub fn update_crawl_progress(
        &self,
        source_id: &str,
        patch: ProgressPatch,
    ) -> Result<SourceMetadata> {
        let source = self.modify(source_id, |source| {
            patch.clone().apply(&mut source.metadata.crawl_progress);
        })?;
        Ok(source.metadata)
    }

    pub fn add_discovered_link(
        &self,
        source_id: &str,
        url: &str,
        depth: u32,
    ) -> Result<SourceMetadata> {
        self.batch_add_discovered_links(source_id, vec![(url.to_string(), depth)])
    }

    /// Appends links to the discovery timeline in the given order
    pub fn batch_add_discovered_links(
        &self,
        source_id: &str,
        links: Vec<(String, u32)>,
    ) -> Result<SourceMetadata> {
        let now = timestamp_now();
        let count = links.len();
        let source = self.modify(source_id, |source| {
            source.metadata.append_links(links.iter().cloned(), now);
        })?;
        debug!("Recorded {} discovered links for source {}", count, source_id);
        Ok(source.metadata)
    }

    /// Records an error and applies the circuit breaker
    ///
    /// When consecutive errors reach the threshold the source is forced to
    /// `failed` and the message is surfaced as its `error_message`.
    pub fn track_error(
        &self,
        source_id: &str,
        error_type: &str,
        message: &str,
    ) -> Result<ErrorOutcome> {
        let now = timestamp_now();
        let threshold = self.circuit_breaker_threshold;
        let mut tripped = false;

        let source = self.modify(source_id, |source| {
            tripped = source.metadata.record_error(error_type, message, threshold, now);
            if tripped && source.status.can_transition_to(SourceStatus::Failed) {
                source.status = SourceStatus::Failed;
                source.error_message = Some(message.to_string());
            }
        })?;

        let tracking = &source.metadata.error_tracking;
        if tripped {
            warn!(
                "Circuit breaker opened for source {} after {} consecutive errors: {}",
                source_id, tracking.consecutive_errors, message
            );
        }

        Ok(ErrorOutcome {
            consecutive_errors: tracking.consecutive_errors,
            circuit_tripped: tripped,
            circuit_broken: tracking.circuit_broken,
        })
    }

    /// Resets consecutive errors; totals and source status are untouched
    pub fn clear_errors(&self, source_id: &str) -> Result<SourceMetadata> {
        let source = self.modify(source_id, |source| source.metadata.clear_errors())?;
        Ok(source.metadata)
    }

    pub fn update_performance_stats(
        &self,
        source_id: &str,
        update: PerformanceUpdate,
    ) -> Result<SourceMetadata> {
        let source = self.modify(source_id, |source| source.metadata.apply_performance(update))?;
        Ok(source.metadata)
    }

    pub fn source_progress(&self, source_id: &str) -> Result<SourceProgress> {
        let source = lock(&self.storage)?
            .get_source(source_id)?
            .ok_or_else(|| ResearchError::not_found("source", source_id))?;
        let metadata = source.metadata;

        Ok(SourceProgress {
            source_id: source.id,
            status: source.status,
            crawl_status: metadata.crawl_status,
            progress: metadata.crawl_progress,
            errors: metadata.error_tracking,
            performance: metadata.performance_stats,
            discovery_rate_per_minute: metadata.discovery_rate_per_minute,
        })
    }

    pub fn research_crawl_statistics(&self, research_id: &str) -> Result<ResearchCrawlStatistics> {
        let storage = lock(&self.storage)?;
        if storage.get_research(research_id)?.is_none() {
            return Err(ResearchError::not_found("research", research_id));
        }
        let sources = storage.list_sources(research_id)?;
        Ok(ResearchCrawlStatistics::from_sources(research_id, &sources))
    }
}
