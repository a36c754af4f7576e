use url::Url;

/// Normalizes a URL into its canonical form for deduplication
///
/// # Normalization Steps
///
/// 1. Parse the URL; malformed input falls back to textual cleanup
/// 2. Remove fragment (everything after #)
/// 3. Sort query parameters by key, keeping each raw `key=value` pair intact
/// 4. Remove empty query string (trailing ?)
/// 5. Remove trailing slashes from the path (except for root /)
/// 6. Lowercase the reassembled string
///
/// The result is stable under repeated application.
///
/// # Examples
///
/// ```
/// use ripple_research::url::normalize_url;
///
/// assert_eq!(
///     normalize_url("HTTP://Example.com/a/?b=2&a=1#frag"),
///     "http://example.com/a?a=1&b=2"
/// );
/// ```
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(url) => canonicalize(url),
        Err(_) => textual_cleanup(raw),
    }
}

fn canonicalize(mut url: Url) -> String {
    url.set_fragment(None);

    if let Some(query) = url.query() {
        let sorted = sort_query(query);
        if sorted.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&sorted));
        }
    }

    if !url.cannot_be_a_base() {
        let path = url.path();
        if path.len() > 1 && path.ends_with('/') {
            let trimmed = path.trim_end_matches('/').to_string();
            url.set_path(&trimmed);
        }
    }

    url.as_str().to_lowercase()
}

/// Sorts raw query pairs by their lowercased key; equal keys keep input order
fn sort_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    pairs.sort_by_key(|pair| pair.split('=').next().unwrap_or("").to_lowercase());
    pairs.join("&")
}

fn textual_cleanup(raw: &str) -> String {
    let without_fragment = raw.trim().split('#').next().unwrap_or("");
    without_fragment
        .trim_end_matches('/')
        .trim()
        .to_lowercase()
}
