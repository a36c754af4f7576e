//! URL handling for Ripple-Research
//!
//! Canonicalization and dedup keys for source URLs, domain extraction, and the
//! strict validation applied when a source is added.

mod domain;
mod normalize;

use crate::UrlError;
use url::Url;

pub use domain::{domain_of, extract_domain};
pub use normalize::normalize_url;

/// Computes the dedup key for a URL: the MD5 hex digest of its canonical form
///
/// Two URLs that normalize to the same string always share a key.
pub fn url_hash(raw: &str) -> String {
    format!("{:x}", md5::compute(normalize_url(raw)))
}

/// Parses a user-supplied source URL, rejecting anything that cannot be fetched
///
/// # Returns
///
/// * `Ok(Url)` - An absolute http(s) URL with a host
/// * `Err(UrlError)` - The URL is malformed, uses another scheme, or has no host
pub fn parse_source_url(raw: &str) -> Result<Url, UrlError> {
    let url = Url::parse(raw.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(format!(
            "Only HTTP and HTTPS schemes are supported, got: {}",
            url.scheme()
        )));
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlError::MissingDomain);
    }

    Ok(url)
}
