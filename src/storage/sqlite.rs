//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::document::ExportFormat;
use crate::state::{
    DomainRecord, ResearchStatus, SectionStatus, SourceStatus, SourceType, UrlStatus,
    WorkflowPhase,
};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    timestamp_now, CrawledContentRecord, ExportRecord, ProcessedDataRecord, ResearchRecord,
    SectionRecord, SourceRecord, UrlRecord,
};
use crate::telemetry::{decode_metadata, encode_metadata};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::path::Path;

const RESEARCH_COLUMNS: &str = "id, topic, description, strategy, status, failed_phase, \
     failed_entity_id, error_message, created_at, updated_at";

const SOURCE_COLUMNS: &str = "id, research_id, url, url_hash, title, source_type, status, \
     error_message, token_count, metadata, created_at, updated_at";

const SECTION_COLUMNS: &str = "id, research_id, parent_section_id, title, description, \
     order_index, status, content, word_count, token_count, created_at, updated_at";

const EXPORT_COLUMNS: &str =
    "id, research_id, format, content, download_count, created_at, expires_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        // Configure SQLite for better performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

// ===== Column Conversion Helpers =====

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(idx, &row.get::<_, String>(idx)?)
}

fn get_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_ts(idx, &raw))
        .transpose()
}

fn get_opt_u64(row: &Row, idx: usize) -> rusqlite::Result<Option<u64>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(|v| v.max(0) as u64))
}

fn get_json<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_i64(value: Option<u64>) -> Option<i64> {
    value.map(|v| v as i64)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

// ===== Row Mapping =====

fn research_from_row(row: &Row) -> rusqlite::Result<ResearchRecord> {
    Ok(ResearchRecord {
        id: row.get(0)?,
        topic: row.get(1)?,
        description: row.get(2)?,
        strategy: row.get(3)?,
        status: ResearchStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(ResearchStatus::Failed),
        failed_phase: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| WorkflowPhase::from_db_string(&s)),
        failed_entity_id: row.get(6)?,
        error_message: row.get(7)?,
        created_at: get_ts(row, 8)?,
        updated_at: get_ts(row, 9)?,
    })
}

fn source_from_row(row: &Row) -> rusqlite::Result<SourceRecord> {
    let blob: String = row.get(9)?;
    let metadata = decode_metadata(&blob)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

    Ok(SourceRecord {
        id: row.get(0)?,
        research_id: row.get(1)?,
        url: row.get(2)?,
        url_hash: row.get(3)?,
        title: row.get(4)?,
        source_type: SourceType::from_db_string(&row.get::<_, String>(5)?)
            .unwrap_or(SourceType::Web),
        status: SourceStatus::from_db_string(&row.get::<_, String>(6)?)
            .unwrap_or(SourceStatus::Failed),
        error_message: row.get(7)?,
        token_count: get_opt_u64(row, 8)?,
        metadata,
        created_at: get_ts(row, 10)?,
        updated_at: get_ts(row, 11)?,
    })
}

fn section_from_row(row: &Row) -> rusqlite::Result<SectionRecord> {
    Ok(SectionRecord {
        id: row.get(0)?,
        research_id: row.get(1)?,
        parent_section_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        order_index: row.get(5)?,
        status: SectionStatus::from_db_string(&row.get::<_, String>(6)?)
            .unwrap_or(SectionStatus::Pending),
        content: row.get(7)?,
        word_count: get_opt_u64(row, 8)?,
        token_count: get_opt_u64(row, 9)?,
        created_at: get_ts(row, 10)?,
        updated_at: get_ts(row, 11)?,
    })
}

fn export_from_row(row: &Row) -> rusqlite::Result<ExportRecord> {
    let format: String = row.get(2)?;
    Ok(ExportRecord {
        id: row.get(0)?,
        research_id: row.get(1)?,
        format: format.parse().unwrap_or(ExportFormat::Markdown),
        content: row.get(3)?,
        download_count: row.get::<_, i64>(4)?.max(0) as u64,
        created_at: get_ts(row, 5)?,
        expires_at: get_opt_ts(row, 6)?,
    })
}

fn processed_from_row(row: &Row) -> rusqlite::Result<ProcessedDataRecord> {
    Ok(ProcessedDataRecord {
        source_id: row.get(0)?,
        research_id: row.get(1)?,
        keywords: get_json(row, 2)?,
        facts: get_json(row, 3)?,
        summary: row.get(4)?,
        created_at: get_ts(row, 5)?,
    })
}

// ===== Row Writes =====

fn write_research(conn: &Connection, record: &ResearchRecord) -> StorageResult<()> {
    conn.execute(
        "UPDATE research_records SET topic = ?1, description = ?2, strategy = ?3, status = ?4,
         failed_phase = ?5, failed_entity_id = ?6, error_message = ?7, updated_at = ?8
         WHERE id = ?9",
        params![
            record.topic,
            record.description,
            record.strategy,
            record.status.to_db_string(),
            record.failed_phase.map(|p| p.to_db_string()),
            record.failed_entity_id,
            record.error_message,
            ts(&record.updated_at),
            record.id
        ],
    )?;
    Ok(())
}

fn write_source(conn: &Connection, source: &SourceRecord) -> StorageResult<()> {
    let metadata = encode_metadata(&source.metadata)?;
    conn.execute(
        "UPDATE research_sources SET title = ?1, status = ?2, error_message = ?3,
         token_count = ?4, metadata = ?5, updated_at = ?6 WHERE id = ?7",
        params![
            source.title,
            source.status.to_db_string(),
            source.error_message,
            opt_i64(source.token_count),
            metadata,
            ts(&source.updated_at),
            source.id
        ],
    )?;
    Ok(())
}

fn write_section(conn: &Connection, section: &SectionRecord) -> StorageResult<()> {
    conn.execute(
        "UPDATE document_sections SET title = ?1, description = ?2, order_index = ?3,
         status = ?4, content = ?5, word_count = ?6, token_count = ?7, updated_at = ?8
         WHERE id = ?9",
        params![
            section.title,
            section.description,
            section.order_index,
            section.status.to_db_string(),
            section.content,
            opt_i64(section.word_count),
            opt_i64(section.token_count),
            ts(&section.updated_at),
            section.id
        ],
    )?;
    Ok(())
}

impl Storage for SqliteStorage {
    // ===== Research Records =====

    fn insert_research(&mut self, record: &ResearchRecord) -> StorageResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO research_records ({RESEARCH_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                record.id,
                record.topic,
                record.description,
                record.strategy,
                record.status.to_db_string(),
                record.failed_phase.map(|p| p.to_db_string()),
                record.failed_entity_id,
                record.error_message,
                ts(&record.created_at),
                ts(&record.updated_at)
            ],
        )?;
        Ok(())
    }

    fn get_research(&self, id: &str) -> StorageResult<Option<ResearchRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {RESEARCH_COLUMNS} FROM research_records WHERE id = ?1"),
                params![id],
                research_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn list_research(&self) -> StorageResult<Vec<ResearchRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RESEARCH_COLUMNS} FROM research_records ORDER BY created_at, id"
        ))?;
        let records = stmt
            .query_map([], research_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn modify_research(
        &mut self,
        id: &str,
        apply: &mut dyn FnMut(&mut ResearchRecord) -> bool,
    ) -> StorageResult<Option<ResearchRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = tx
            .query_row(
                &format!("SELECT {RESEARCH_COLUMNS} FROM research_records WHERE id = ?1"),
                params![id],
                research_from_row,
            )
            .optional()?;

        let Some(mut record) = current else {
            return Ok(None);
        };

        if apply(&mut record) {
            record.updated_at = timestamp_now();
            write_research(&tx, &record)?;
        }
        tx.commit()?;
        Ok(Some(record))
    }

    // ===== Sources =====

    fn insert_source(&mut self, source: &SourceRecord) -> StorageResult<()> {
        let metadata = encode_metadata(&source.metadata)?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO research_sources ({SOURCE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    source.id,
                    source.research_id,
                    source.url,
                    source.url_hash,
                    source.title,
                    source.source_type.to_db_string(),
                    source.status.to_db_string(),
                    source.error_message,
                    opt_i64(source.token_count),
                    metadata,
                    ts(&source.created_at),
                    ts(&source.updated_at)
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StorageError::ConstraintViolation(format!(
                        "source {} for research {}: {}",
                        source.url, source.research_id, e
                    ))
                } else {
                    StorageError::Sqlite(e)
                }
            })?;
        Ok(())
    }

    fn get_source(&self, id: &str) -> StorageResult<Option<SourceRecord>> {
        let source = self
            .conn
            .query_row(
                &format!("SELECT {SOURCE_COLUMNS} FROM research_sources WHERE id = ?1"),
                params![id],
                source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    fn find_source_by_hash(
        &self,
        research_id: &str,
        url_hash: &str,
    ) -> StorageResult<Option<SourceRecord>> {
        let source = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SOURCE_COLUMNS} FROM research_sources
                     WHERE research_id = ?1 AND url_hash = ?2"
                ),
                params![research_id, url_hash],
                source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    fn list_sources(&self, research_id: &str) -> StorageResult<Vec<SourceRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SOURCE_COLUMNS} FROM research_sources
             WHERE research_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let sources = stmt
            .query_map(params![research_id], source_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    fn modify_source(
        &mut self,
        id: &str,
        apply: &mut dyn FnMut(&mut SourceRecord) -> bool,
    ) -> StorageResult<Option<SourceRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = tx
            .query_row(
                &format!("SELECT {SOURCE_COLUMNS} FROM research_sources WHERE id = ?1"),
                params![id],
                source_from_row,
            )
            .optional()?;

        let Some(mut source) = current else {
            return Ok(None);
        };

        if apply(&mut source) {
            source.updated_at = timestamp_now();
            write_source(&tx, &source)?;
        }
        tx.commit()?;
        Ok(Some(source))
    }

    // ===== Domains =====

    fn upsert_domain(&mut self, domain: &DomainRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO domains (domain, robots_rules, crawl_delay_ms, last_crawl_at, robots_fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(domain) DO UPDATE SET
                robots_rules = excluded.robots_rules,
                crawl_delay_ms = excluded.crawl_delay_ms,
                last_crawl_at = excluded.last_crawl_at,
                robots_fetched_at = excluded.robots_fetched_at",
            params![
                domain.domain,
                domain.robots_rules,
                domain.crawl_delay_ms as i64,
                opt_ts(&domain.last_crawl_at),
                opt_ts(&domain.robots_fetched_at)
            ],
        )?;
        Ok(())
    }

    fn get_domain(&self, domain: &str) -> StorageResult<Option<DomainRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT domain, robots_rules, crawl_delay_ms, last_crawl_at, robots_fetched_at
                 FROM domains WHERE domain = ?1",
                params![domain],
                |row| {
                    Ok(DomainRecord {
                        domain: row.get(0)?,
                        robots_rules: row.get(1)?,
                        crawl_delay_ms: row.get::<_, i64>(2)?.max(0) as u64,
                        last_crawl_at: get_opt_ts(row, 3)?,
                        robots_fetched_at: get_opt_ts(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ===== URLs and Crawled Content =====

    fn upsert_url(&mut self, url: &UrlRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO urls (url_hash, domain, raw_url, status, http_status, crawl_session_id, last_crawled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(url_hash) DO UPDATE SET
                status = excluded.status,
                http_status = excluded.http_status,
                crawl_session_id = excluded.crawl_session_id,
                last_crawled_at = excluded.last_crawled_at",
            params![
                url.url_hash,
                url.domain,
                url.raw_url,
                url.status.to_db_string(),
                url.http_status,
                url.crawl_session_id,
                opt_ts(&url.last_crawled_at)
            ],
        )?;
        Ok(())
    }

    fn get_url(&self, url_hash: &str) -> StorageResult<Option<UrlRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT url_hash, domain, raw_url, status, http_status, crawl_session_id, last_crawled_at
                 FROM urls WHERE url_hash = ?1",
                params![url_hash],
                |row| {
                    Ok(UrlRecord {
                        url_hash: row.get(0)?,
                        domain: row.get(1)?,
                        raw_url: row.get(2)?,
                        status: UrlStatus::from_db_string(&row.get::<_, String>(3)?)
                            .unwrap_or(UrlStatus::Pending),
                        http_status: row.get(4)?,
                        crawl_session_id: row.get(5)?,
                        last_crawled_at: get_opt_ts(row, 6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_crawled_content(&mut self, content: &CrawledContentRecord) -> StorageResult<()> {
        let links = serde_json::to_string(&content.links)?;
        self.conn.execute(
            "INSERT INTO crawled_content (url_hash, title, extracted_text, links, crawled_at, crawl_session_id, research_source_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(url_hash) DO UPDATE SET
                title = excluded.title,
                extracted_text = excluded.extracted_text,
                links = excluded.links,
                crawled_at = excluded.crawled_at,
                crawl_session_id = excluded.crawl_session_id,
                research_source_id = excluded.research_source_id",
            params![
                content.url_hash,
                content.title,
                content.extracted_text,
                links,
                ts(&content.crawled_at),
                content.crawl_session_id,
                content.research_source_id
            ],
        )?;
        Ok(())
    }

    fn get_crawled_content(&self, url_hash: &str) -> StorageResult<Option<CrawledContentRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT url_hash, title, extracted_text, links, crawled_at, crawl_session_id, research_source_id
                 FROM crawled_content WHERE url_hash = ?1",
                params![url_hash],
                |row| {
                    Ok(CrawledContentRecord {
                        url_hash: row.get(0)?,
                        title: row.get(1)?,
                        extracted_text: row.get(2)?,
                        links: get_json(row, 3)?,
                        crawled_at: get_ts(row, 4)?,
                        crawl_session_id: row.get(5)?,
                        research_source_id: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ===== Processed Data =====

    fn replace_processed_data(&mut self, data: &ProcessedDataRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO processed_data (source_id, research_id, keywords, facts, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(source_id) DO UPDATE SET
                keywords = excluded.keywords,
                facts = excluded.facts,
                summary = excluded.summary,
                created_at = excluded.created_at",
            params![
                data.source_id,
                data.research_id,
                serde_json::to_string(&data.keywords)?,
                serde_json::to_string(&data.facts)?,
                data.summary,
                ts(&data.created_at)
            ],
        )?;
        Ok(())
    }

    fn get_processed_data(&self, source_id: &str) -> StorageResult<Option<ProcessedDataRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT source_id, research_id, keywords, facts, summary, created_at
                 FROM processed_data WHERE source_id = ?1",
                params![source_id],
                processed_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn list_processed_data(&self, research_id: &str) -> StorageResult<Vec<ProcessedDataRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_id, research_id, keywords, facts, summary, created_at
             FROM processed_data WHERE research_id = ?1 ORDER BY created_at, source_id",
        )?;
        let records = stmt
            .query_map(params![research_id], processed_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ===== Sections =====

    fn insert_sections(&mut self, sections: &[SectionRecord]) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO document_sections ({SECTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ))?;
            for section in sections {
                stmt.execute(params![
                    section.id,
                    section.research_id,
                    section.parent_section_id,
                    section.title,
                    section.description,
                    section.order_index,
                    section.status.to_db_string(),
                    section.content,
                    opt_i64(section.word_count),
                    opt_i64(section.token_count),
                    ts(&section.created_at),
                    ts(&section.updated_at)
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_section(&self, id: &str) -> StorageResult<Option<SectionRecord>> {
        let section = self
            .conn
            .query_row(
                &format!("SELECT {SECTION_COLUMNS} FROM document_sections WHERE id = ?1"),
                params![id],
                section_from_row,
            )
            .optional()?;
        Ok(section)
    }

    fn list_sections(&self, research_id: &str) -> StorageResult<Vec<SectionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SECTION_COLUMNS} FROM document_sections
             WHERE research_id = ?1 ORDER BY order_index, created_at, rowid"
        ))?;
        let sections = stmt
            .query_map(params![research_id], section_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sections)
    }

    fn modify_section(
        &mut self,
        id: &str,
        apply: &mut dyn FnMut(&mut SectionRecord) -> bool,
    ) -> StorageResult<Option<SectionRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = tx
            .query_row(
                &format!("SELECT {SECTION_COLUMNS} FROM document_sections WHERE id = ?1"),
                params![id],
                section_from_row,
            )
            .optional()?;

        let Some(mut section) = current else {
            return Ok(None);
        };

        if apply(&mut section) {
            section.updated_at = timestamp_now();
            write_section(&tx, &section)?;
        }
        tx.commit()?;
        Ok(Some(section))
    }

    fn reorder_sections(&mut self, updates: &[(String, i64)]) -> StorageResult<()> {
        let now = ts(&timestamp_now());
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        for (id, order_index) in updates {
            let changed = tx.execute(
                "UPDATE document_sections SET order_index = ?1, updated_at = ?2 WHERE id = ?3",
                params![order_index, now, id],
            )?;
            if changed == 0 {
                // Dropping the transaction rolls back earlier updates
                return Err(StorageError::ConstraintViolation(format!(
                    "section {} does not exist",
                    id
                )));
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ===== Exports =====

    fn insert_export(&mut self, export: &ExportRecord) -> StorageResult<()> {
        self.conn.execute(
            &format!("INSERT INTO exports ({EXPORT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                export.id,
                export.research_id,
                export.format.as_str(),
                export.content,
                export.download_count as i64,
                ts(&export.created_at),
                opt_ts(&export.expires_at)
            ],
        )?;
        Ok(())
    }

    fn get_export(&self, id: &str) -> StorageResult<Option<ExportRecord>> {
        let export = self
            .conn
            .query_row(
                &format!("SELECT {EXPORT_COLUMNS} FROM exports WHERE id = ?1"),
                params![id],
                export_from_row,
            )
            .optional()?;
        Ok(export)
    }

    fn latest_export_by_format(
        &self,
        research_id: &str,
        format: ExportFormat,
    ) -> StorageResult<Option<ExportRecord>> {
        let export = self
            .conn
            .query_row(
                &format!(
                    "SELECT {EXPORT_COLUMNS} FROM exports
                     WHERE research_id = ?1 AND format = ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![research_id, format.as_str()],
                export_from_row,
            )
            .optional()?;
        Ok(export)
    }

    fn list_exports(&self, research_id: &str) -> StorageResult<Vec<ExportRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXPORT_COLUMNS} FROM exports WHERE research_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let exports = stmt
            .query_map(params![research_id], export_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(exports)
    }

    fn increment_download_count(&mut self, id: &str) -> StorageResult<Option<u64>> {
        let changed = self.conn.execute(
            "UPDATE exports SET download_count = download_count + 1 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        let count: i64 = self.conn.query_row(
            "SELECT download_count FROM exports WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(count.max(0) as u64))
    }

    fn delete_expired_exports(&mut self, now: DateTime<Utc>) -> StorageResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM exports WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![ts(&now)],
        )?;
        Ok(removed)
    }
}
