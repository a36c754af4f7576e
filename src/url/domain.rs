use url::Url;

/// Extracts the domain from a parsed URL
///
/// Returns the lowercase host, or `None` for URLs without one.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use ripple_research::url::extract_domain;
///
/// let url = Url::parse("https://EXAMPLE.COM/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Extracts the domain from a raw URL string
pub fn domain_of(raw: &str) -> Option<String> {
    Url::parse(raw.trim()).ok().as_ref().and_then(extract_domain)
}
