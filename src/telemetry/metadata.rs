//! Versioned crawl metadata stored on every source
//!
//! The blob is persisted as JSON carrying a string `version` tag. Older blobs
//! (version "1" flat layout, or no tag at all) are migrated when read; writes
//! always produce the current version.

use crate::state::CrawlStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk version of [`SourceMetadata`]
pub const METADATA_VERSION: &str = "2";

/// Crawl telemetry for one source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceMetadata {
    pub crawl_status: CrawlStatus,
    pub crawl_session_id: Option<String>,
    pub crawl_progress: CrawlProgress,
    pub error_tracking: ErrorTracking,
    pub performance_stats: PerformanceStats,
    /// Append-only, in discovery order
    pub link_discovery_timeline: Vec<DiscoveredLink>,
    pub discovery_rate_per_minute: f64,
    pub last_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlProgress {
    pub total_links_discovered: u64,
    pub total_pages_crawled: u64,
    pub estimated_time_remaining_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorTracking {
    pub total_error_count: u64,
    pub consecutive_errors: u32,
    pub last_error_message: Option<String>,
    pub last_error_type: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub circuit_broken: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceStats {
    /// Successful attempts over all attempts, in `0.0..=1.0`
    pub success_rate: f64,
    pub total_tokens: u64,
    pub avg_duration_ms: Option<f64>,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    /// Number of attempts that reported a duration
    pub duration_samples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub url: String,
    pub discovered_at: DateTime<Utc>,
    pub depth: u32,
}

/// Partial update for [`CrawlProgress`]; `None` fields keep their prior value
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub total_links_discovered: Option<u64>,
    pub total_pages_crawled: Option<u64>,
    pub estimated_time_remaining_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressPatch {
    pub fn apply(self, progress: &mut CrawlProgress) {
        if let Some(v) = self.total_links_discovered {
            progress.total_links_discovered = v;
        }
        if let Some(v) = self.total_pages_crawled {
            progress.total_pages_crawled = v;
        }
        if let Some(v) = self.estimated_time_remaining_ms {
            progress.estimated_time_remaining_ms = Some(v);
        }
        if let Some(v) = self.started_at {
            progress.started_at = Some(v);
        }
        if let Some(v) = self.completed_at {
            progress.completed_at = Some(v);
        }
    }
}

/// One fetch attempt folded into [`PerformanceStats`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceUpdate {
    pub succeeded: bool,
    pub tokens: u64,
    pub duration_ms: Option<u64>,
}

impl SourceMetadata {
    /// Freshly initialized metadata for a new source
    pub fn initialize(now: DateTime<Utc>) -> Self {
        Self {
            last_updated_at: Some(now),
            ..Self::default()
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_updated_at = Some(now);
    }

    /// Records one error; returns true when this error trips the circuit breaker
    ///
    /// A tripped breaker forces `crawl_status = failed` and stays tripped until
    /// [`SourceMetadata::reset_for_retry`].
    pub fn record_error(
        &mut self,
        error_type: &str,
        message: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let tracking = &mut self.error_tracking;
        tracking.total_error_count += 1;
        tracking.consecutive_errors = tracking.consecutive_errors.saturating_add(1);
        tracking.last_error_message = Some(message.to_string());
        tracking.last_error_type = Some(error_type.to_string());
        tracking.last_error_at = Some(now);

        let tripped = !tracking.circuit_broken && tracking.consecutive_errors >= threshold;
        if tripped {
            tracking.circuit_broken = true;
        }
        if tracking.circuit_broken {
            self.crawl_status = CrawlStatus::Failed;
        }
        tripped
    }

    /// Resets the consecutive error counter; history and breaker state are kept
    pub fn clear_errors(&mut self) {
        self.error_tracking.consecutive_errors = 0;
    }

    /// Re-arms the source for an explicit retry
    pub fn reset_for_retry(&mut self) {
        self.error_tracking.consecutive_errors = 0;
        self.error_tracking.circuit_broken = false;
        self.crawl_status = CrawlStatus::Idle;
    }

    /// Appends links to the discovery timeline and refreshes derived counters
    pub fn append_links<I>(&mut self, links: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = (String, u32)>,
    {
        let before = self.link_discovery_timeline.len();
        self.link_discovery_timeline
            .extend(links.into_iter().map(|(url, depth)| DiscoveredLink {
                url,
                discovered_at: now,
                depth,
            }));
        let added = (self.link_discovery_timeline.len() - before) as u64;
        self.crawl_progress.total_links_discovered += added;
        self.discovery_rate_per_minute = discovery_rate(&self.link_discovery_timeline);
    }

    pub fn apply_performance(&mut self, update: PerformanceUpdate) {
        let stats = &mut self.performance_stats;
        stats.total_attempts += 1;
        if update.succeeded {
            stats.successful_attempts += 1;
        }
        stats.success_rate = stats.successful_attempts as f64 / stats.total_attempts as f64;
        stats.total_tokens += update.tokens;

        if let Some(duration) = update.duration_ms {
            let prior = stats.avg_duration_ms.unwrap_or(0.0) * stats.duration_samples as f64;
            stats.duration_samples += 1;
            stats.avg_duration_ms = Some((prior + duration as f64) / stats.duration_samples as f64);
        }
    }
}

/// Links per minute over the span of the timeline (a span under one minute counts as one)
pub fn discovery_rate(timeline: &[DiscoveredLink]) -> f64 {
    let (Some(first), Some(last)) = (timeline.first(), timeline.last()) else {
        return 0.0;
    };
    let span_minutes = (last.discovered_at - first.discovered_at).num_milliseconds() as f64 / 60_000.0;
    timeline.len() as f64 / span_minutes.max(1.0)
}

#[derive(Serialize)]
#[serde(tag = "version")]
enum StoredRef<'a> {
    #[serde(rename = "2")]
    V2(&'a SourceMetadata),
}

#[derive(Deserialize)]
#[serde(tag = "version")]
enum Stored {
    #[serde(rename = "1")]
    V1(LegacyMetadata),
    #[serde(rename = "2")]
    V2(SourceMetadata),
}

/// Flat layout written before progress, errors, and stats were nested
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacyMetadata {
    crawl_status: Option<CrawlStatus>,
    total_links_discovered: u64,
    total_pages_crawled: u64,
    total_error_count: u64,
    consecutive_errors: u32,
    last_error_message: Option<String>,
    success_rate: f64,
    total_tokens: u64,
    avg_duration_ms: Option<f64>,
    link_discovery_timeline: Vec<DiscoveredLink>,
    last_updated_at: Option<DateTime<Utc>>,
}

impl From<LegacyMetadata> for SourceMetadata {
    fn from(old: LegacyMetadata) -> Self {
        let discovery_rate_per_minute = discovery_rate(&old.link_discovery_timeline);
        Self {
            crawl_status: old.crawl_status.unwrap_or_default(),
            crawl_session_id: None,
            crawl_progress: CrawlProgress {
                total_links_discovered: old.total_links_discovered,
                total_pages_crawled: old.total_pages_crawled,
                ..CrawlProgress::default()
            },
            error_tracking: ErrorTracking {
                total_error_count: old.total_error_count,
                consecutive_errors: old.consecutive_errors,
                last_error_message: old.last_error_message,
                circuit_broken: old.crawl_status == Some(CrawlStatus::Failed),
                ..ErrorTracking::default()
            },
            performance_stats: PerformanceStats {
                success_rate: old.success_rate,
                total_tokens: old.total_tokens,
                avg_duration_ms: old.avg_duration_ms,
                ..PerformanceStats::default()
            },
            link_discovery_timeline: old.link_discovery_timeline,
            discovery_rate_per_minute,
            last_updated_at: old.last_updated_at,
        }
    }
}

/// Serializes metadata in the current versioned layout
pub fn encode_metadata(metadata: &SourceMetadata) -> Result<String, serde_json::Error> {
    serde_json::to_string(&StoredRef::V2(metadata))
}

/// Parses a stored blob, migrating older layouts
pub fn decode_metadata(blob: &str) -> Result<SourceMetadata, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(blob)?;
    let tagged = value.get("version").is_some();

    if tagged {
        match serde_json::from_value::<Stored>(value)? {
            Stored::V1(old) => Ok(old.into()),
            Stored::V2(current) => Ok(current),
        }
    } else {
        let old: LegacyMetadata = serde_json::from_value(value)?;
        Ok(old.into())
    }
}
