use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Ripple-Research
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(rename = "user-agent", default)]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CrawlerConfig {
    /// Size of the worker pool processing pending sources
    pub max_concurrent_fetches: u32,

    /// Minimum time between fetches to the same domain (milliseconds)
    pub default_crawl_delay_ms: u64,

    /// Upper bound on a single fetch/extraction (milliseconds)
    pub fetch_timeout_ms: u64,

    /// Crawled content younger than this is reused instead of re-fetched
    pub recrawl_ttl_hours: u64,

    /// Whether robots.txt rules are fetched and enforced
    pub respect_robots: bool,
}

impl CrawlerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn recrawl_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.recrawl_ttl_hours as i64)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            default_crawl_delay_ms: 1000,
            fetch_timeout_ms: 30_000,
            recrawl_ttl_hours: 24,
            respect_robots: true,
        }
    }
}

/// Telemetry and circuit breaker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TelemetryConfig {
    /// Consecutive errors after which a source is force-failed
    pub circuit_breaker_threshold: u32,

    /// Base delay before a transiently failed source is retried (milliseconds)
    pub retry_backoff_ms: u64,

    /// Cap for the exponential retry backoff (milliseconds)
    pub max_retry_backoff_ms: u64,
}

impl TelemetryConfig {
    /// Backoff after the given number of consecutive errors (exponential, capped)
    pub fn backoff_for(&self, consecutive_errors: u32) -> Duration {
        let exponent = consecutive_errors.saturating_sub(1).min(16);
        let delay = self.retry_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_retry_backoff_ms))
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: 5,
            retry_backoff_ms: 2_000,
            max_retry_backoff_ms: 60_000,
        }
    }
}

/// Workflow defaults for outline generation and drafting
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkflowConfig {
    /// Number of top-level sections generated by the outline phase
    pub sections_count: u32,

    /// Nesting depth of the generated outline (1 = top-level only)
    pub outline_depth: u32,

    /// Upper bound on a single outline or drafting call (milliseconds)
    pub draft_timeout_ms: u64,

    /// Export format produced by the final workflow phase
    pub export_format: String,
}

impl WorkflowConfig {
    pub fn draft_timeout(&self) -> Duration {
        Duration::from_millis(self.draft_timeout_ms)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            sections_count: 5,
            outline_depth: 1,
            draft_timeout_ms: 60_000,
            export_format: "markdown".to_string(),
        }
    }
}

/// Export artifact configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ExportConfig {
    /// Lifetime of a generated export; 0 keeps exports forever
    pub ttl_hours: u64,
}

impl ExportConfig {
    pub fn ttl(&self) -> Option<chrono::Duration> {
        (self.ttl_hours > 0).then(|| chrono::Duration::hours(self.ttl_hours as i64))
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self { ttl_hours: 168 }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UserAgentConfig {
    /// Name of the crawler
    pub crawler_name: String,

    /// Version of the crawler
    pub crawler_version: String,

    /// URL with information about the crawler
    pub contact_url: String,

    /// Email address for crawler-related contact
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the user agent header: `Name/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            crawler_name: "RippleResearch".to_string(),
            crawler_version: env!("CARGO_PKG_VERSION").to_string(),
            contact_url: "https://example.com/about".to_string(),
            contact_email: "crawler@example.com".to_string(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OutputConfig {
    /// Path to the SQLite database file
    pub database_path: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            database_path: "./ripple-research.db".to_string(),
        }
    }
}
