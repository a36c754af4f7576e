//! Crawler module for fetching research sources
//!
//! This module contains the network-facing half of the engine:
//! - Content fetching behind the `ContentFetcher` trait
//! - HTML text, title, and link extraction
//! - The per-domain politeness governor
//! - The bounded worker pool that drains pending sources

mod fetcher;
mod governor;
mod parser;
mod scheduler;

pub use fetcher::{build_http_client, ContentFetcher, FetchError, FetchedContent, HttpFetcher};
pub use governor::{Admission, DomainGovernor, FetchPermit};
pub use parser::{parse_html, ParsedPage};
pub use scheduler::{Disposition, ScheduleReport, SourceScheduler};
