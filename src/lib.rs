//! Ripple-Research: a polite research crawler and document workflow engine
//!
//! This crate ingests research sources (web pages, PDFs, academic documents, APIs),
//! crawls them while respecting per-domain politeness, tracks crawl telemetry per
//! source, and drives a resumable workflow from source processing through outline
//! generation, section drafting, and export.

pub mod config;
pub mod crawler;
pub mod document;
pub mod robots;
pub mod sources;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod url;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

use thiserror::Error;

/// Main error type for Ripple-Research operations
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Drafting error: {0}")]
    Drafting(#[from] workflow::DraftError),

    #[error("{operation} timed out for {id}")]
    Timeout { operation: &'static str, id: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResearchError {
    /// Shorthand for a not-found error on the given entity kind
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Returns true for errors the caller caused (bad input or unmet preconditions)
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Url(_) | Self::Precondition(_) | Self::NotFound { .. }
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,
}

/// Result type alias for Ripple-Research operations
pub type Result<T> = std::result::Result<T, ResearchError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use state::{ResearchStatus, SectionStatus, SourceStatus, SourceType};
pub use url::{domain_of, normalize_url, url_hash};
pub use workflow::WorkflowOrchestrator;
