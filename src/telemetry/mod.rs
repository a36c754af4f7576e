//! Crawl telemetry module
//!
//! Each source carries a versioned metadata blob with crawl progress, error
//! history, performance aggregates, and a link discovery timeline. This module
//! owns the blob format, the atomic update operations, and the research-level
//! rollup.

mod aggregator;
mod metadata;
mod stats;

pub use aggregator::{CrawlTelemetry, ErrorOutcome, SourceProgress};
pub use metadata::{
    decode_metadata, discovery_rate, encode_metadata, CrawlProgress, DiscoveredLink,
    ErrorTracking, PerformanceStats, PerformanceUpdate, ProgressPatch, SourceMetadata,
    METADATA_VERSION,
};
pub use stats::{print_statistics, ResearchCrawlStatistics};
