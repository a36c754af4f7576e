//! HTML extraction for fetched web sources
//!
//! Produces the three things the source lifecycle stores for a page:
//! - Title (from `<title>`, falling back to the first `<h1>`)
//! - Visible text (script, style, and template contents excluded)
//! - Outbound links (absolute http(s), deduplicated by canonical form)

use crate::url::normalize_url;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Elements whose text never counts as readable content
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "svg", "head"];

/// Extracted information from an HTML page
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub title: Option<String>,

    /// Readable text with whitespace collapsed
    pub text: String,

    /// Links found on the page (absolute URLs, first occurrence wins)
    pub links: Vec<String>,
}

/// Parses HTML content and extracts title, text, and links
///
/// # Link Extraction Rules
///
/// **Include:** `<a href>` anywhere in the document and `<link rel="canonical">`
///
/// **Exclude:** `download` anchors, `javascript:`/`mailto:`/`tel:`/`data:`
/// hrefs, fragment-only anchors, and anything that does not resolve to http(s)
///
/// # Example
///
/// ```no_run
/// use ripple_research::crawler::parse_html;
/// use url::Url;
///
/// let html = r#"<html><head><title>Test</title></head><body><a href="/page">Link</a></body></html>"#;
/// let base_url = Url::parse("https://example.com/").unwrap();
/// let parsed = parse_html(html, &base_url);
/// assert_eq!(parsed.title, Some("Test".to_string()));
/// ```
pub fn parse_html(html: &str, base_url: &Url) -> ParsedPage {
    let document = Html::parse_document(html);

    ParsedPage {
        title: extract_title(&document),
        text: extract_text(&document),
        links: extract_links(&document, base_url),
    }
}

fn first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .map(|element| collapse(&element.text().collect::<String>()))
        .filter(|s| !s.is_empty())
}

fn extract_title(document: &Html) -> Option<String> {
    first_text(document, "title").or_else(|| first_text(document, "h1"))
}

/// Collects text nodes that are not inside a hidden element
fn extract_text(document: &Html) -> String {
    let root = Selector::parse("body")
        .ok()
        .and_then(|selector| document.select(&selector).next())
        .unwrap_or_else(|| document.root_element());

    let mut pieces = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ElementRef::wrap(ancestor)
                .map(|element| HIDDEN_ELEMENTS.contains(&element.value().name()))
                .unwrap_or(false)
        });
        if !hidden {
            pieces.push(&**text);
        }
    }

    collapse(&pieces.join(" "))
}

fn extract_links(document: &Html, base_url: &Url) -> Vec<String> {
    let mut links = Vec::new();
    let mut seen = HashSet::new();

    let mut push = |href: &str| {
        if let Some(absolute) = resolve_link(href, base_url) {
            if seen.insert(normalize_url(&absolute)) {
                links.push(absolute);
            }
        }
    };

    if let Ok(anchor_selector) = Selector::parse("a[href]") {
        for element in document.select(&anchor_selector) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(href) = element.value().attr("href") {
                push(href);
            }
        }
    }

    if let Ok(canonical_selector) = Selector::parse("link[rel='canonical'][href]") {
        for element in document.select(&canonical_selector) {
            if let Some(href) = element.value().attr("href") {
                push(href);
            }
        }
    }

    links
}

/// Resolves an href against the page URL; `None` when the link is excluded
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lowered = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lowered.starts_with(scheme))
    {
        return None;
    }

    let absolute = base_url.join(href).ok()?;
    matches!(absolute.scheme(), "http" | "https").then(|| absolute.to_string())
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
