//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Ripple-Research database.
//! Timestamps are RFC 3339 UTC strings with millisecond precision, so they
//! compare correctly as text.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Research sessions (root aggregate)
CREATE TABLE IF NOT EXISTS research_records (
    id TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    description TEXT,
    strategy TEXT NOT NULL,
    status TEXT NOT NULL,
    failed_phase TEXT,
    failed_entity_id TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Sources ingested into a research session
CREATE TABLE IF NOT EXISTS research_sources (
    id TEXT PRIMARY KEY,
    research_id TEXT NOT NULL REFERENCES research_records(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    title TEXT,
    source_type TEXT NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    token_count INTEGER,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(research_id, url_hash)
);

CREATE INDEX IF NOT EXISTS idx_sources_research ON research_sources(research_id);
CREATE INDEX IF NOT EXISTS idx_sources_status ON research_sources(status);

-- Per-domain politeness state
CREATE TABLE IF NOT EXISTS domains (
    domain TEXT PRIMARY KEY,
    robots_rules TEXT,
    crawl_delay_ms INTEGER NOT NULL,
    last_crawl_at TEXT,
    robots_fetched_at TEXT
);

-- Canonical URLs
CREATE TABLE IF NOT EXISTS urls (
    url_hash TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    raw_url TEXT NOT NULL,
    status TEXT NOT NULL,
    http_status INTEGER,
    crawl_session_id TEXT,
    last_crawled_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_urls_domain ON urls(domain);

-- Latest extracted content per URL
CREATE TABLE IF NOT EXISTS crawled_content (
    url_hash TEXT PRIMARY KEY REFERENCES urls(url_hash),
    title TEXT,
    extracted_text TEXT NOT NULL,
    links TEXT NOT NULL,
    crawled_at TEXT NOT NULL,
    crawl_session_id TEXT,
    research_source_id TEXT
);

-- Facts and keywords derived per source
CREATE TABLE IF NOT EXISTS processed_data (
    source_id TEXT PRIMARY KEY REFERENCES research_sources(id) ON DELETE CASCADE,
    research_id TEXT NOT NULL,
    keywords TEXT NOT NULL,
    facts TEXT NOT NULL,
    summary TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processed_research ON processed_data(research_id);

-- Document section tree
CREATE TABLE IF NOT EXISTS document_sections (
    id TEXT PRIMARY KEY,
    research_id TEXT NOT NULL REFERENCES research_records(id) ON DELETE CASCADE,
    parent_section_id TEXT,
    title TEXT NOT NULL,
    description TEXT,
    order_index INTEGER NOT NULL,
    status TEXT NOT NULL,
    content TEXT,
    word_count INTEGER,
    token_count INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sections_research ON document_sections(research_id);
CREATE INDEX IF NOT EXISTS idx_sections_parent ON document_sections(parent_section_id);

-- Generated export artifacts
CREATE TABLE IF NOT EXISTS exports (
    id TEXT PRIMARY KEY,
    research_id TEXT NOT NULL REFERENCES research_records(id) ON DELETE CASCADE,
    format TEXT NOT NULL,
    content TEXT NOT NULL,
    download_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    expires_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_exports_research_format ON exports(research_id, format);
CREATE INDEX IF NOT EXISTS idx_exports_expires ON exports(expires_at);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
