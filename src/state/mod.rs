//! State module for the research workflow
//!
//! This module defines the status enums persisted for every entity and the
//! per-domain politeness record.
//!
//! # Components
//!
//! - `SourceStatus` / `SourceType` / `CrawlStatus`: lifecycle of an ingested source
//! - `ResearchStatus` / `WorkflowCapabilities` / `WorkflowPhase`: the research record state machine
//! - `SectionStatus`: drafting state of a document section
//! - `UrlStatus`: crawl state of a canonical URL
//! - `DomainRecord`: per-domain politeness rules and last fetch time

mod domain_state;
mod research_state;
mod section_state;
mod source_state;
mod url_state;

pub use domain_state::{DomainRecord, MAX_ROBOTS_CRAWL_DELAY};
pub use research_state::{ResearchStatus, WorkflowCapabilities, WorkflowPhase};
pub use section_state::SectionStatus;
pub use source_state::{CrawlStatus, SourceStatus, SourceType};
pub use url_state::UrlStatus;
