use std::fmt;

/// Crawl state of a canonical URL
///
/// Moves `pending -> crawled|failed` within one attempt and may reset to
/// `pending` once its crawled content outlives the re-crawl TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrlStatus {
    Pending,
    Crawled,
    Failed,
}

impl UrlStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Crawled => "crawled",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "crawled" => Some(Self::Crawled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
