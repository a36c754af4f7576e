//! Storage module for persisting research data
//!
//! This module handles all database operations for the engine, including:
//! - SQLite database initialization and schema management
//! - Research records, sources, and their telemetry blobs
//! - Domain politeness state, canonical URLs, and crawled content
//! - Document sections and export artifacts

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::document::ExportFormat;
use crate::state::{
    ResearchStatus, SectionStatus, SourceStatus, SourceType, UrlStatus, WorkflowPhase,
};
use crate::telemetry::SourceMetadata;
use crate::ResearchError;

use chrono::{DateTime, SubsecRound, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Storage handle shared between the orchestrator, workers, and services
pub type SharedStorage = Arc<Mutex<dyn Storage + Send>>;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SharedStorage)` - Successfully initialized storage
/// * `Err(ResearchError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SharedStorage, ResearchError> {
    Ok(Arc::new(Mutex::new(SqliteStorage::new(path)?)))
}

/// Wraps a storage backend for sharing
pub fn shared<S: Storage + Send + 'static>(storage: S) -> SharedStorage {
    Arc::new(Mutex::new(storage))
}

/// Locks the shared storage, surfacing a poisoned mutex as an error
pub fn lock(storage: &SharedStorage) -> StorageResult<MutexGuard<'_, dyn Storage + Send + 'static>> {
    storage
        .lock()
        .map_err(|e| StorageError::Lock(e.to_string()))
}

/// Current time at the precision timestamps are stored with
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Generates a new entity id
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The root aggregate for one research session
#[derive(Debug, Clone, PartialEq)]
pub struct ResearchRecord {
    pub id: String,
    pub topic: String,
    pub description: Option<String>,
    pub strategy: String,
    pub status: ResearchStatus,
    /// Phase the last failed run stopped in
    pub failed_phase: Option<WorkflowPhase>,
    /// Source or section the last failure is attributed to
    pub failed_entity_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchRecord {
    pub fn new(topic: &str, description: Option<&str>, strategy: &str) -> Self {
        let now = timestamp_now();
        Self {
            id: new_id(),
            topic: topic.to_string(),
            description: description.map(str::to_string),
            strategy: strategy.to_string(),
            status: ResearchStatus::Initializing,
            failed_phase: None,
            failed_entity_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn clear_failure(&mut self) {
        self.failed_phase = None;
        self.failed_entity_id = None;
        self.error_message = None;
    }
}

/// One ingested source of a research record
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub id: String,
    pub research_id: String,
    pub url: String,
    /// Dedup key of the canonical URL
    pub url_hash: String,
    pub title: Option<String>,
    pub source_type: SourceType,
    pub status: SourceStatus,
    pub error_message: Option<String>,
    pub token_count: Option<u64>,
    pub metadata: SourceMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceRecord {
    /// A new `pending` source with freshly initialized telemetry
    pub fn new(research_id: &str, url: &str, url_hash: &str, source_type: SourceType) -> Self {
        let now = timestamp_now();
        Self {
            id: new_id(),
            research_id: research_id.to_string(),
            url: url.to_string(),
            url_hash: url_hash.to_string(),
            title: None,
            source_type,
            status: SourceStatus::Pending,
            error_message: None,
            token_count: None,
            metadata: SourceMetadata::initialize(now),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A canonical URL and its latest crawl outcome
#[derive(Debug, Clone, PartialEq)]
pub struct UrlRecord {
    pub url_hash: String,
    pub domain: String,
    pub raw_url: String,
    pub status: UrlStatus,
    pub http_status: Option<u16>,
    pub crawl_session_id: Option<String>,
    pub last_crawled_at: Option<DateTime<Utc>>,
}

/// Latest extracted content for a URL (one row per url)
#[derive(Debug, Clone, PartialEq)]
pub struct CrawledContentRecord {
    pub url_hash: String,
    pub title: Option<String>,
    pub extracted_text: String,
    pub links: Vec<String>,
    pub crawled_at: DateTime<Utc>,
    pub crawl_session_id: Option<String>,
    pub research_source_id: Option<String>,
}

/// Facts and keywords derived from a completed source
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDataRecord {
    pub source_id: String,
    pub research_id: String,
    pub keywords: Vec<String>,
    pub facts: Vec<String>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// A node in the document section tree
#[derive(Debug, Clone, PartialEq)]
pub struct SectionRecord {
    pub id: String,
    pub research_id: String,
    pub parent_section_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub order_index: i64,
    pub status: SectionStatus,
    pub content: Option<String>,
    pub word_count: Option<u64>,
    pub token_count: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SectionRecord {
    /// A new `pending` section
    pub fn new(
        research_id: &str,
        parent_section_id: Option<&str>,
        title: &str,
        description: Option<&str>,
        order_index: i64,
    ) -> Self {
        let now = timestamp_now();
        Self {
            id: new_id(),
            research_id: research_id.to_string(),
            parent_section_id: parent_section_id.map(str::to_string),
            title: title.to_string(),
            description: description.map(str::to_string),
            order_index,
            status: SectionStatus::Pending,
            content: None,
            word_count: None,
            token_count: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A generated document artifact
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub id: String,
    pub research_id: String,
    pub format: ExportFormat,
    pub content: String,
    pub download_count: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}
