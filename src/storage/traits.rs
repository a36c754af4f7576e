//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::document::ExportFormat;
use crate::state::DomainRecord;
use crate::storage::{
    CrawledContentRecord, ExportRecord, ProcessedDataRecord, ResearchRecord, SectionRecord,
    SourceRecord, UrlRecord,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Storage lock poisoned: {0}")]
    Lock(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Lookups return `Ok(None)` for unknown ids; callers decide whether that is
/// an error. The `modify_*` methods are atomic read-modify-write cycles: the
/// closure sees the current row and returns whether it changed it, and only
/// changed rows are written back.
pub trait Storage {
    // ===== Research Records =====

    fn insert_research(&mut self, record: &ResearchRecord) -> StorageResult<()>;

    fn get_research(&self, id: &str) -> StorageResult<Option<ResearchRecord>>;

    fn list_research(&self) -> StorageResult<Vec<ResearchRecord>>;

    /// Atomically updates a research record
    ///
    /// # Returns
    ///
    /// The record after the closure ran, or `None` if the id is unknown
    fn modify_research(
        &mut self,
        id: &str,
        apply: &mut dyn FnMut(&mut ResearchRecord) -> bool,
    ) -> StorageResult<Option<ResearchRecord>>;

    // ===== Sources =====

    /// Inserts a source; fails with a constraint violation if the
    /// `(research_id, url_hash)` pair already exists
    fn insert_source(&mut self, source: &SourceRecord) -> StorageResult<()>;

    fn get_source(&self, id: &str) -> StorageResult<Option<SourceRecord>>;

    fn find_source_by_hash(
        &self,
        research_id: &str,
        url_hash: &str,
    ) -> StorageResult<Option<SourceRecord>>;

    /// Lists the sources of a research record in creation order
    fn list_sources(&self, research_id: &str) -> StorageResult<Vec<SourceRecord>>;

    /// Atomically updates a source row including its metadata blob
    fn modify_source(
        &mut self,
        id: &str,
        apply: &mut dyn FnMut(&mut SourceRecord) -> bool,
    ) -> StorageResult<Option<SourceRecord>>;

    // ===== Domains =====

    fn upsert_domain(&mut self, domain: &DomainRecord) -> StorageResult<()>;

    fn get_domain(&self, domain: &str) -> StorageResult<Option<DomainRecord>>;

    // ===== URLs and Crawled Content =====

    fn upsert_url(&mut self, url: &UrlRecord) -> StorageResult<()>;

    fn get_url(&self, url_hash: &str) -> StorageResult<Option<UrlRecord>>;

    /// Replaces the latest content for a URL
    fn upsert_crawled_content(&mut self, content: &CrawledContentRecord) -> StorageResult<()>;

    fn get_crawled_content(&self, url_hash: &str) -> StorageResult<Option<CrawledContentRecord>>;

    // ===== Processed Data =====

    fn replace_processed_data(&mut self, data: &ProcessedDataRecord) -> StorageResult<()>;

    fn get_processed_data(&self, source_id: &str) -> StorageResult<Option<ProcessedDataRecord>>;

    fn list_processed_data(&self, research_id: &str) -> StorageResult<Vec<ProcessedDataRecord>>;

    // ===== Sections =====

    /// Inserts a batch of sections in one transaction
    fn insert_sections(&mut self, sections: &[SectionRecord]) -> StorageResult<()>;

    fn get_section(&self, id: &str) -> StorageResult<Option<SectionRecord>>;

    /// Lists all sections of a research record ordered by `order_index`, then creation time
    fn list_sections(&self, research_id: &str) -> StorageResult<Vec<SectionRecord>>;

    fn modify_section(
        &mut self,
        id: &str,
        apply: &mut dyn FnMut(&mut SectionRecord) -> bool,
    ) -> StorageResult<Option<SectionRecord>>;

    /// Applies `(section_id, order_index)` pairs in one transaction
    fn reorder_sections(&mut self, updates: &[(String, i64)]) -> StorageResult<()>;

    // ===== Exports =====

    fn insert_export(&mut self, export: &ExportRecord) -> StorageResult<()>;

    fn get_export(&self, id: &str) -> StorageResult<Option<ExportRecord>>;

    fn latest_export_by_format(
        &self,
        research_id: &str,
        format: ExportFormat,
    ) -> StorageResult<Option<ExportRecord>>;

    fn list_exports(&self, research_id: &str) -> StorageResult<Vec<ExportRecord>>;

    /// Increments the download counter, returning the new value
    fn increment_download_count(&mut self, id: &str) -> StorageResult<Option<u64>>;

    /// Deletes exports whose `expires_at` is before `now`, returning how many were removed
    fn delete_expired_exports(&mut self, now: DateTime<Utc>) -> StorageResult<usize>;
}
