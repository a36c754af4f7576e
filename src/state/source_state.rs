/// Source state definitions
///
/// A source moves `pending -> processing -> {complete, failed}`; a failed source
/// only returns to `pending` through an explicit retry.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a research source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceStatus {
    /// Waiting to be fetched
    Pending,

    /// A worker holds the source and is fetching it
    Processing,

    /// Content was fetched and processed
    Complete,

    /// Unrecoverable error or tripped circuit breaker
    Failed,
}

impl SourceStatus {
    /// Returns true if no further processing happens without intervention
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Returns true if the lifecycle allows moving from `self` to `next`
    ///
    /// `Processing -> Pending` covers transient failures and crash recovery;
    /// `Pending -> Failed` covers a circuit breaker tripping between attempts.
    pub fn can_transition_to(&self, next: SourceStatus) -> bool {
        use SourceStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Complete)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Failed, Pending)
        )
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns all possible source states
    pub fn all_states() -> Vec<Self> {
        vec![Self::Pending, Self::Processing, Self::Complete, Self::Failed]
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Kind of content a source points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    Web,
    Pdf,
    Academic,
    Api,
}

impl SourceType {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Pdf => "pdf",
            Self::Academic => "academic",
            Self::Api => "api",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "web" => Some(Self::Web),
            "pdf" => Some(Self::Pdf),
            "academic" => Some(Self::Academic),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_string(&s.trim().to_lowercase()).ok_or_else(|| {
            format!(
                "unknown source type '{}', expected one of: web, pdf, academic, api",
                s
            )
        })
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Crawl status tracked in source telemetry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    #[default]
    Idle,
    Queued,
    Active,
    Completed,
    Failed,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
