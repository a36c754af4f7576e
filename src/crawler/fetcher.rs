//! Content fetcher implementation
//!
//! This module handles all network access for the engine, including:
//! - The `ContentFetcher` seam the source lifecycle fetches through
//! - Building HTTP clients with proper user agent strings
//! - Extracting text and links from HTML, PDF, JSON, and plain text bodies
//! - Error classification (transient vs. unrecoverable)

use crate::config::UserAgentConfig;
use crate::crawler::parser::parse_html;
use crate::state::SourceType;
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Content extracted from one fetched source
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedContent {
    pub http_status: u16,
    /// Final URL after redirects
    pub final_url: String,
    pub title: Option<String>,
    pub extracted_text: String,
    /// Absolute http(s) links found in the content, in document order
    pub links: Vec<String>,
}

/// Typed fetch failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("redirect error: {0}")]
    Redirect(String),

    #[error("failed to extract content: {0}")]
    Parse(String),

    #[error("disallowed by robots.txt")]
    ForbiddenByRobots,

    #[error("unsupported content type: {0}")]
    UnsupportedContent(String),
}

impl FetchError {
    /// Returns true for failures worth retrying: network errors, 5xx, and 429
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited => true,
            Self::HttpStatus { status } => *status >= 500,
            _ => false,
        }
    }

    /// Short machine-readable error code recorded in telemetry
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout => "timeout",
            Self::HttpStatus { .. } => "http_status",
            Self::RateLimited => "rate_limited",
            Self::Redirect(_) => "redirect",
            Self::Parse(_) => "parse",
            Self::ForbiddenByRobots => "forbidden_by_robots",
            Self::UnsupportedContent(_) => "unsupported_content",
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status } => Some(*status),
            Self::RateLimited => Some(429),
            _ => None,
        }
    }
}

/// Fetches and extracts source content
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetches `url` and extracts its text and links
    async fn fetch(&self, url: &Url, source_type: SourceType) -> Result<FetchedContent, FetchError>;

    /// Fetches a robots.txt file; `Ok(None)` means there are no rules
    async fn fetch_robots(&self, robots_url: &Url) -> Result<Option<String>, FetchError> {
        let _ = robots_url;
        Ok(None)
    }
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The user agent configuration
/// * `timeout` - Overall request timeout
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use ripple_research::config::UserAgentConfig;
/// use ripple_research::crawler::build_http_client;
/// use std::time::Duration;
///
/// let client = build_http_client(&UserAgentConfig::default(), Duration::from_secs(30)).unwrap();
/// ```
pub fn build_http_client(
    config: &UserAgentConfig,
    timeout: Duration,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10).min(timeout))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// `ContentFetcher` backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &UserAgentConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config, timeout)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// Classifies a reqwest error
fn classify_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_redirect() {
        FetchError::Redirect(e.to_string())
    } else {
        FetchError::Network(e.to_string())
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, source_type: SourceType) -> Result<FetchedContent, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let body = response.bytes().await.map_err(classify_error)?;

        let extracted = extract_body(body.to_vec(), &content_type, &final_url, source_type).await?;

        Ok(FetchedContent {
            http_status: status.as_u16(),
            final_url: final_url.to_string(),
            title: extracted.title,
            extracted_text: extracted.text,
            links: extracted.links,
        })
    }

    async fn fetch_robots(&self, robots_url: &Url) -> Result<Option<String>, FetchError> {
        let response = self
            .client
            .get(robots_url.clone())
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        if status.is_success() {
            let body = response.text().await.map_err(classify_error)?;
            Ok(Some(body))
        } else if status.is_client_error() {
            // Missing robots.txt means no restrictions
            Ok(None)
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
            })
        }
    }
}

struct ExtractedBody {
    title: Option<String>,
    text: String,
    links: Vec<String>,
}

/// Dispatches on the content type (falling back to sniffing the body)
async fn extract_body(
    body: Vec<u8>,
    content_type: &str,
    final_url: &Url,
    source_type: SourceType,
) -> Result<ExtractedBody, FetchError> {
    let is_pdf = content_type.contains("application/pdf")
        || body.starts_with(b"%PDF")
        || (source_type == SourceType::Pdf && content_type.contains("octet-stream"));

    if is_pdf {
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&body))
            .await
            .map_err(|e| FetchError::Parse(format!("PDF extraction task failed: {}", e)))?
            .map_err(|e| FetchError::Parse(format!("PDF extraction failed: {}", e)))?;
        return Ok(ExtractedBody {
            title: None,
            text: collapse_whitespace(&text),
            links: Vec::new(),
        });
    }

    if content_type.contains("json") {
        let value: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| FetchError::Parse(e.to_string()))?;
        let text = serde_json::to_string_pretty(&value).map_err(|e| FetchError::Parse(e.to_string()))?;
        return Ok(ExtractedBody {
            title: None,
            text,
            links: Vec::new(),
        });
    }

    let text = String::from_utf8_lossy(&body);
    let looks_like_html = content_type.contains("html")
        || (content_type.is_empty() && text.trim_start().starts_with('<'));

    if looks_like_html {
        let parsed = parse_html(&text, final_url);
        return Ok(ExtractedBody {
            title: parsed.title,
            text: parsed.text,
            links: parsed.links,
        });
    }

    if content_type.starts_with("text/") || content_type.is_empty() {
        return Ok(ExtractedBody {
            title: None,
            text: text.trim().to_string(),
            links: Vec::new(),
        });
    }

    Err(FetchError::UnsupportedContent(content_type.to_string()))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_http_client() {
        let client = build_http_client(&UserAgentConfig::default(), Duration::from_secs(5));
        assert!(client.is_ok());
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Network("refused".into()).is_transient());
        assert!(FetchError::RateLimited.is_transient());
        assert!(FetchError::HttpStatus { status: 503 }.is_transient());

        assert!(!FetchError::HttpStatus { status: 404 }.is_transient());
        assert!(!FetchError::Timeout.is_transient());
        assert!(!FetchError::ForbiddenByRobots.is_transient());
        assert!(!FetchError::Parse("bad".into()).is_transient());
    }

    #[test]
    fn test_error_metadata() {
        assert_eq!(FetchError::RateLimited.http_status(), Some(429));
        assert_eq!(FetchError::HttpStatus { status: 502 }.error_type(), "http_status");
        assert_eq!(FetchError::Timeout.error_type(), "timeout");
    }

    #[tokio::test]
    async fn test_extract_json_is_pretty_printed() {
        let url = Url::parse("https://api.example.com/v1/items").unwrap();
        let body = br#"{"items":[1,2]}"#.to_vec();
        let extracted = extract_body(body, "application/json; charset=utf-8", &url, SourceType::Api)
            .await
            .unwrap();
        assert!(extracted.text.contains("\"items\": ["));
    }

    #[tokio::test]
    async fn test_extract_unsupported() {
        let url = Url::parse("https://example.com/image.png").unwrap();
        let result = extract_body(vec![0x89, 0x50], "image/png", &url, SourceType::Web).await;
        assert!(matches!(result, Err(FetchError::UnsupportedContent(_))));
    }

    #[tokio::test]
    async fn test_invalid_pdf_is_parse_error() {
        let url = Url::parse("https://example.com/paper.pdf").unwrap();
        let result = extract_body(
            b"%PDF-1.4 truncated".to_vec(),
            "application/pdf",
            &url,
            SourceType::Pdf,
        )
        .await;
        assert!(matches!(result, Err(FetchError::Parse(_))));
    }

    #[tokio::test]
    async fn test_sniffs_html_without_content_type() {
        let url = Url::parse("https://example.com/").unwrap();
        let body = b"<html><head><title>T</title></head><body><p>Hello</p></body></html>".to_vec();
        let extracted = extract_body(body, "", &url, SourceType::Web).await.unwrap();
        assert_eq!(extracted.title.as_deref(), Some("T"));
        assert_eq!(extracted.text, "Hello");
    }
}
