//! Research-level crawl statistics
//!
//! Rolls the per-source telemetry of one research record up into a single
//! summary and renders it for the CLI.

use crate::state::{CrawlStatus, SourceStatus};
use crate::storage::SourceRecord;
use std::collections::HashMap;

/// Crawl statistics summary for one research record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResearchCrawlStatistics {
    pub research_id: String,

    pub total_sources: u64,

    /// Count of sources by lifecycle status
    pub sources_by_status: HashMap<SourceStatus, u64>,

    pub queued_crawls: u64,
    pub active_crawls: u64,
    pub completed_crawls: u64,
    pub failed_crawls: u64,

    pub total_links_discovered: u64,
    pub total_pages_crawled: u64,
    pub total_errors: u64,

    /// Sources whose circuit breaker is currently open
    pub broken_circuits: u64,

    pub total_tokens: u64,

    /// Mean success rate over sources with at least one fetch attempt
    pub average_success_rate: Option<f64>,
}

impl ResearchCrawlStatistics {
    /// Aggregates the telemetry of the given sources
    pub fn from_sources(research_id: &str, sources: &[SourceRecord]) -> Self {
        let mut stats = Self {
            research_id: research_id.to_string(),
            total_sources: sources.len() as u64,
            ..Self::default()
        };

        let mut rate_sum = 0.0;
        let mut rated = 0u64;

        for source in sources {
            *stats.sources_by_status.entry(source.status).or_insert(0) += 1;

            let metadata = &source.metadata;
            match metadata.crawl_status {
                CrawlStatus::Idle => {}
                CrawlStatus::Queued => stats.queued_crawls += 1,
                CrawlStatus::Active => stats.active_crawls += 1,
                CrawlStatus::Completed => stats.completed_crawls += 1,
                CrawlStatus::Failed => stats.failed_crawls += 1,
            }

            stats.total_links_discovered += metadata.crawl_progress.total_links_discovered;
            stats.total_pages_crawled += metadata.crawl_progress.total_pages_crawled;
            stats.total_errors += metadata.error_tracking.total_error_count;
            stats.total_tokens += metadata.performance_stats.total_tokens;
            if metadata.error_tracking.circuit_broken {
                stats.broken_circuits += 1;
            }

            if metadata.performance_stats.total_attempts > 0 {
                rate_sum += metadata.performance_stats.success_rate;
                rated += 1;
            }
        }

        if rated > 0 {
            stats.average_success_rate = Some(rate_sum / rated as f64);
        }

        stats
    }

    pub fn count(&self, status: SourceStatus) -> u64 {
        self.sources_by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &ResearchCrawlStatistics) {
    println!("=== Crawl Statistics: {} ===\n", stats.research_id);

    println!("Sources: {}", stats.total_sources);
    for status in SourceStatus::all_states() {
        let count = stats.count(status);
        let percentage = if stats.total_sources > 0 {
            (count as f64 / stats.total_sources as f64) * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", status, count, percentage);
    }
    println!();

    println!("Crawls:");
    println!("  Queued: {}", stats.queued_crawls);
    println!("  Active: {}", stats.active_crawls);
    println!("  Completed: {}", stats.completed_crawls);
    println!("  Failed: {}", stats.failed_crawls);
    println!();

    println!("Totals:");
    println!("  Pages crawled: {}", stats.total_pages_crawled);
    println!("  Links discovered: {}", stats.total_links_discovered);
    println!("  Tokens: {}", stats.total_tokens);
    println!("  Errors: {}", stats.total_errors);
    if stats.broken_circuits > 0 {
        println!("  Open circuit breakers: {}", stats.broken_circuits);
    }
    println!();

    match stats.average_success_rate {
        Some(rate) => println!("Average Success Rate: {:.1}%", rate * 100.0),
        None => println!("Average Success Rate: n/a (no fetch attempts yet)"),
    }
}
