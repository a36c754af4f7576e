//! Per-domain politeness gate
//!
//! The governor decides whether a fetch to a domain may start now. It never
//! sleeps: a refused request gets `Admission::Deferred(wait)` and the caller
//! re-queues its work. robots.txt requests count as fetches and go through
//! the same permit.

use crate::crawler::fetcher::ContentFetcher;
use crate::robots::{agent_token, robots_url};
use crate::state::DomainRecord;
use crate::storage::{lock, timestamp_now, SharedStorage};
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// How soon to look again at a domain whose fetch is still in flight
const IN_FLIGHT_RECHECK: Duration = Duration::from_millis(50);

/// How long a failed robots.txt fetch is trusted as "allow" before retrying
const ROBOTS_RETRY_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default)]
struct DomainSlot {
    in_flight: bool,
    last_fetch: Option<Instant>,
    robots_failed_at: Option<Instant>,
}

type SlotMap = Arc<Mutex<HashMap<String, DomainSlot>>>;

/// Result of asking the governor for a fetch slot
#[derive(Debug)]
pub enum Admission {
    Granted(FetchPermit),
    Deferred(Duration),
}

/// Exclusive right to fetch from one domain; released on drop
#[derive(Debug)]
pub struct FetchPermit {
    domain: String,
    slots: SlotMap,
}

impl FetchPermit {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(slot) = slots.get_mut(&self.domain) {
                slot.in_flight = false;
            }
        }
    }
}

/// Enforces crawl delays and robots rules per domain
#[derive(Clone)]
pub struct DomainGovernor {
    storage: SharedStorage,
    default_delay_ms: u64,
    respect_robots: bool,
    agent: String,
    slots: SlotMap,
}

impl DomainGovernor {
    /// Creates a governor
    ///
    /// # Arguments
    ///
    /// * `storage` - Where domain records live
    /// * `default_delay_ms` - Crawl delay given to newly discovered domains
    /// * `respect_robots` - Whether robots.txt is fetched and enforced
    /// * `user_agent` - Full user agent header; its product token selects robots groups
    pub fn new(
        storage: SharedStorage,
        default_delay_ms: u64,
        respect_robots: bool,
        user_agent: &str,
    ) -> Self {
        Self {
            storage,
            default_delay_ms,
            respect_robots,
            agent: agent_token(user_agent).to_string(),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Inserts or replaces the politeness settings of a domain
    pub fn upsert(
        &self,
        domain: &str,
        robots_rules: Option<String>,
        crawl_delay_ms: u64,
    ) -> Result<DomainRecord> {
        let mut storage = lock(&self.storage)?;
        let mut record = storage
            .get_domain(domain)?
            .unwrap_or_else(|| DomainRecord::new(domain, crawl_delay_ms));
        record.robots_rules = robots_rules;
        record.crawl_delay_ms = crawl_delay_ms;
        storage.upsert_domain(&record)?;
        Ok(record)
    }

    pub fn get_by_domain(&self, domain: &str) -> Result<Option<DomainRecord>> {
        Ok(lock(&self.storage)?.get_domain(domain)?)
    }

    /// Returns the domain record, creating it with defaults on first sight
    pub fn discover(&self, domain: &str) -> Result<DomainRecord> {
        let mut storage = lock(&self.storage)?;
        if let Some(existing) = storage.get_domain(domain)? {
            return Ok(existing);
        }
        let record = DomainRecord::new(domain, self.default_delay_ms);
        storage.upsert_domain(&record)?;
        debug!("Discovered domain {}", domain);
        Ok(record)
    }

    /// Persists `last_crawl_at = now` for a domain
    pub fn record_fetch(&self, domain: &str) -> Result<()> {
        let mut storage = lock(&self.storage)?;
        let mut record = storage
            .get_domain(domain)?
            .unwrap_or_else(|| DomainRecord::new(domain, self.default_delay_ms));
        record.record_fetch(timestamp_now());
        storage.upsert_domain(&record)?;
        Ok(())
    }

    /// Asks for permission to fetch from `domain` now
    ///
    /// Granting marks the domain in flight and records the fetch. The
    /// persisted `last_crawl_at` is only consulted until this process has
    /// fetched from the domain itself.
    pub fn try_acquire(&self, domain: &str) -> Result<Admission> {
        let record = self.discover(domain)?;
        let delay = record.effective_delay(&self.agent);

        {
            let mut slots = lock_slots(&self.slots);
            let slot = slots.entry(domain.to_string()).or_default();

            let wait = match slot.last_fetch {
                Some(last) => delay.saturating_sub(last.elapsed()),
                None => record
                    .time_until_next_fetch(delay, timestamp_now())
                    .unwrap_or(Duration::ZERO),
            };

            if slot.in_flight {
                return Ok(Admission::Deferred(wait.max(IN_FLIGHT_RECHECK)));
            }
            if !wait.is_zero() {
                return Ok(Admission::Deferred(wait));
            }

            slot.in_flight = true;
            slot.last_fetch = Some(Instant::now());
        }

        self.record_fetch(domain)?;

        Ok(Admission::Granted(FetchPermit {
            domain: domain.to_string(),
            slots: Arc::clone(&self.slots),
        }))
    }

    /// Restarts the delay clock at the moment the fetch actually goes out
    pub fn start_fetch(&self, permit: &FetchPermit) {
        let mut slots = lock_slots(&self.slots);
        if let Some(slot) = slots.get_mut(permit.domain()) {
            slot.last_fetch = Some(Instant::now());
        }
    }

    /// Whether the cached robots rules of `domain` must be fetched before
    /// the next page fetch
    ///
    /// A domain whose last robots fetch failed in this process is treated as
    /// fresh for a while, so its sources are not starved by retries.
    pub fn needs_robots(&self, domain: &str) -> Result<bool> {
        if !self.respect_robots {
            return Ok(false);
        }
        let record = self.discover(domain)?;
        if !record.is_robots_stale(timestamp_now()) {
            return Ok(false);
        }
        let slots = lock_slots(&self.slots);
        let recently_failed = slots
            .get(domain)
            .and_then(|slot| slot.robots_failed_at)
            .is_some_and(|failed| failed.elapsed() < ROBOTS_RETRY_AFTER);
        Ok(!recently_failed)
    }

    /// Fetches robots.txt for the origin of `url` under `permit`
    ///
    /// The request counts as the permit's fetch. Returns the domain's
    /// effective delay afterwards; a page fetch must wait that long. A failed
    /// robots fetch leaves the cache stale and allows requests until
    /// the retry window passes.
    pub async fn refresh_robots(
        &self,
        permit: &FetchPermit,
        url: &Url,
        fetcher: &dyn ContentFetcher,
    ) -> Result<Duration> {
        let domain = permit.domain();
        let Some(location) = robots_url(url) else {
            return Ok(self.discover(domain)?.effective_delay(&self.agent));
        };

        self.start_fetch(permit);
        let fetched = fetcher.fetch_robots(&location).await;

        let mut storage = lock(&self.storage)?;
        let mut record = storage
            .get_domain(domain)?
            .unwrap_or_else(|| DomainRecord::new(domain, self.default_delay_ms));
        match fetched {
            Ok(content) => {
                record.update_robots(content, timestamp_now());
                storage.upsert_domain(&record)?;
                debug!("Refreshed robots.txt for {}", domain);
            }
            Err(e) => {
                warn!("Failed to fetch robots.txt for {}: {}", domain, e);
                let mut slots = lock_slots(&self.slots);
                slots.entry(domain.to_string()).or_default().robots_failed_at = Some(Instant::now());
            }
        }
        Ok(record.effective_delay(&self.agent))
    }

    /// Checks `url` against the cached robots rules of its domain
    pub fn is_allowed(&self, url: &Url) -> Result<bool> {
        if !self.respect_robots {
            return Ok(true);
        }
        let Some(domain) = crate::url::extract_domain(url) else {
            return Ok(true);
        };
        let record = self.discover(&domain)?;
        Ok(record.robots().is_allowed(url.as_str(), &self.agent))
    }
}

fn lock_slots(slots: &SlotMap) -> std::sync::MutexGuard<'_, HashMap<String, DomainSlot>> {
    // Slot state stays consistent across a panic, so a poisoned lock is reused
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
