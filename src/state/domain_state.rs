use crate::robots::ParsedRobots;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Upper bound on a robots.txt `Crawl-delay`
pub const MAX_ROBOTS_CRAWL_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Persisted politeness state for one domain
///
/// Holds the cached robots.txt rules, the minimum delay between fetches, and
/// the time of the last fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainRecord {
    pub domain: String,

    /// Raw robots.txt content; `None` until fetched (or when robots are ignored)
    pub robots_rules: Option<String>,

    /// Minimum time between fetches to this domain (milliseconds)
    pub crawl_delay_ms: u64,

    pub last_crawl_at: Option<DateTime<Utc>>,

    pub robots_fetched_at: Option<DateTime<Utc>>,
}

impl DomainRecord {
    pub fn new(domain: impl Into<String>, crawl_delay_ms: u64) -> Self {
        Self {
            domain: domain.into(),
            robots_rules: None,
            crawl_delay_ms,
            last_crawl_at: None,
            robots_fetched_at: None,
        }
    }

    /// Parsed robots rules, allowing everything when none are cached
    pub fn robots(&self) -> ParsedRobots {
        match &self.robots_rules {
            Some(content) => ParsedRobots::from_content(content),
            None => ParsedRobots::allow_all(),
        }
    }

    /// The delay actually enforced: the larger of the configured delay and
    /// the robots.txt `Crawl-delay` for our agent
    ///
    /// A robots delay is capped at [`MAX_ROBOTS_CRAWL_DELAY`]; NaN and
    /// non-positive values are ignored.
    pub fn effective_delay(&self, user_agent: &str) -> Duration {
        let configured = Duration::from_millis(self.crawl_delay_ms);
        match self.robots().crawl_delay(user_agent) {
            Some(secs) if secs > 0.0 => {
                let robots = Duration::try_from_secs_f64(secs)
                    .unwrap_or(MAX_ROBOTS_CRAWL_DELAY)
                    .min(MAX_ROBOTS_CRAWL_DELAY);
                configured.max(robots)
            }
            _ => configured,
        }
    }

    /// Checks if a fetch may start at `now` given the delay
    pub fn can_fetch(&self, delay: Duration, now: DateTime<Utc>) -> bool {
        self.time_until_next_fetch(delay, now).is_none()
    }

    /// Calculates the time until the next fetch can be made
    ///
    /// Returns None if a fetch can be made now, or the duration to wait otherwise.
    pub fn time_until_next_fetch(&self, delay: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_crawl_at?;
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        (elapsed < delay).then(|| delay - elapsed)
    }

    /// Records that a fetch was issued at `now`
    pub fn record_fetch(&mut self, now: DateTime<Utc>) {
        self.last_crawl_at = Some(now);
    }

    /// Checks if the robots.txt cache is stale (older than 24 hours)
    pub fn is_robots_stale(&self, now: DateTime<Utc>) -> bool {
        match self.robots_fetched_at {
            Some(fetched_at) => now - fetched_at > chrono::Duration::hours(24),
            None => true,
        }
    }

    /// Updates the robots.txt cache
    pub fn update_robots(&mut self, content: Option<String>, now: DateTime<Utc>) {
        self.robots_rules = content;
        self.robots_fetched_at = Some(now);
    }
}
