//! Robots.txt handling module
//!
//! Robots rules are fetched once per domain, cached on the domain record, and
//! consulted before every source fetch.

mod parser;

pub use parser::ParsedRobots;

use url::Url;

/// Returns the robots.txt location for the origin of `url`
///
/// # Examples
///
/// ```
/// use url::Url;
/// use ripple_research::robots::robots_url;
///
/// let url = Url::parse("https://example.com:8443/a/b?c=d").unwrap();
/// assert_eq!(robots_url(&url).unwrap().as_str(), "https://example.com:8443/robots.txt");
/// ```
pub fn robots_url(url: &Url) -> Option<Url> {
    url.join("/robots.txt").ok()
}

/// Extracts the product token robots.txt groups are matched against
///
/// `RippleResearch/0.1.0 (+https://...)` matches groups for `RippleResearch`.
pub fn agent_token(user_agent: &str) -> &str {
    user_agent
        .split(|c: char| c == '/' || c.is_whitespace())
        .next()
        .unwrap_or(user_agent)
}
