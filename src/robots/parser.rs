//! Robots.txt parser implementation
//!
//! This module provides functionality for parsing robots.txt content using the robotstxt crate.

use robotstxt::DefaultMatcher;

/// Parsed robots.txt rules for one domain
///
/// Wraps the robotstxt crate's matcher; rules are evaluated on demand against
/// the cached raw content.
#[derive(Debug, Clone)]
pub struct ParsedRobots {
    /// Raw robots.txt content (empty string means allow all)
    content: String,
    /// Whether to allow all (true = allow all, false = parse content)
    allow_all: bool,
}

impl ParsedRobots {
    /// Creates a new ParsedRobots from raw robots.txt content
    ///
    /// # Arguments
    ///
    /// * `content` - The raw robots.txt file content
    ///
    /// # Returns
    ///
    /// A ParsedRobots instance that can be used to check URL permissions
    pub fn from_content(content: &str) -> Self {
        Self {
            content: content.to_string(),
            allow_all: false,
        }
    }

    /// Creates a permissive ParsedRobots that allows everything
    ///
    /// This is used as the default when robots.txt cannot be fetched or parsed.
    pub fn allow_all() -> Self {
        Self {
            content: String::new(),
            allow_all: true,
        }
    }

    /// Checks if a URL is allowed for the given user agent
    ///
    /// # Arguments
    ///
    /// * `url` - The absolute URL to check
    /// * `user_agent` - The product token of the crawler (see `agent_token`)
    ///
    /// # Returns
    ///
    /// * `true` - If the URL is allowed
    /// * `false` - If the URL is disallowed
    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        if self.allow_all || self.content.trim().is_empty() {
            return true;
        }

        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.content, user_agent, url)
    }

    /// Gets the crawl delay for a specific user agent
    ///
    /// # Arguments
    ///
    /// * `user_agent` - The user agent string
    ///
    /// # Returns
    ///
    /// * `Some(f64)` - The crawl delay in seconds
    /// * `None` - If no crawl delay applies to the agent
    pub fn crawl_delay(&self, user_agent: &str) -> Option<f64> {
        if self.allow_all || self.content.trim().is_empty() {
            return None;
        }

        let agent = user_agent.to_lowercase();
        let mut group: Vec<String> = Vec::new();
        // A User-agent line after any rule line opens a new group
        let mut in_rules = false;
        let mut wildcard_delay = None;
        let mut agent_delay = None;

        for line in self.content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim().to_lowercase().as_str() {
                "user-agent" => {
                    if in_rules {
                        group.clear();
                        in_rules = false;
                    }
                    group.push(value.to_lowercase());
                }
                "crawl-delay" => {
                    in_rules = true;
                    let Ok(delay) = value.parse::<f64>() else {
                        continue;
                    };
                    if group
                        .iter()
                        .any(|ua| !ua.is_empty() && ua != "*" && agent.contains(ua.as_str())) {
                        agent_delay = Some(delay);
                    } else if group.iter().any(|ua| ua == "*") {
                        wildcard_delay = Some(delay);
                    }
                }
                _ => in_rules = true,
            }
        }

        agent_delay.or(wildcard_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://papers.example.org";

    fn url(path: &str) -> String {
        format!("{BASE}{path}")
    }

    #[test]
    fn test_allow_all() {
        let robots = ParsedRobots::allow_all();
        assert!(robots.is_allowed(&url("/admin"), "RippleResearch"));
        assert_eq!(robots.crawl_delay("RippleResearch"), None);
    }

    #[test]
    fn test_disallow_prefix() {
        let robots = ParsedRobots::from_content("User-agent: *\nDisallow: /drafts");
        assert!(robots.is_allowed(&url("/papers/1.pdf"), "RippleResearch"));
        assert!(!robots.is_allowed(&url("/drafts"), "RippleResearch"));
        assert!(!robots.is_allowed(&url("/drafts/2024/x.html"), "RippleResearch"));
    }

    #[test]
    fn test_allow_overrides_longer_match() {
        let robots =
            ParsedRobots::from_content("User-agent: *\nDisallow: /private\nAllow: /private/open");
        assert!(!robots.is_allowed(&url("/private"), "RippleResearch"));
        assert!(robots.is_allowed(&url("/private/open"), "RippleResearch"));
    }

    #[test]
    fn test_agent_specific_group() {
        let robots =
            ParsedRobots::from_content("User-agent: RippleResearch\nDisallow: /\n\nUser-agent: *\nAllow: /");
        assert!(!robots.is_allowed(&url("/page"), "RippleResearch"));
        assert!(robots.is_allowed(&url("/page"), "OtherBot"));
    }

    #[test]
    fn test_garbage_allows_everything() {
        let robots = ParsedRobots::from_content("<html>not robots {{{</html>");
        assert!(robots.is_allowed(&url("/any"), "RippleResearch"));
        let robots = ParsedRobots::from_content("   ");
        assert!(robots.is_allowed(&url("/any"), "RippleResearch"));
    }

    #[test]
    fn test_crawl_delay_wildcard_and_specific() {
        let robots = ParsedRobots::from_content(
            "User-agent: RippleResearch\nCrawl-delay: 5\n\nUser-agent: *\nCrawl-delay: 10",
        );
        assert_eq!(robots.crawl_delay("RippleResearch"), Some(5.0));
        assert_eq!(robots.crawl_delay("OtherBot"), Some(10.0));
    }

    #[test]
    fn test_crawl_delay_after_rules_in_group() {
        let robots =
            ParsedRobots::from_content("User-agent: *\nDisallow: /admin\nCrawl-delay: 2.5 # slow");
        assert_eq!(robots.crawl_delay("rippleresearch"), Some(2.5));
    }

    #[test]
    fn test_crawl_delay_group_ends_at_next_agent() {
        let robots = ParsedRobots::from_content(
            "User-agent: BotA\nUser-agent: BotB\nCrawl-delay: 3\nUser-agent: BotC\nDisallow: /",
        );
        assert_eq!(robots.crawl_delay("BotA"), Some(3.0));
        assert_eq!(robots.crawl_delay("BotB"), Some(3.0));
        assert_eq!(robots.crawl_delay("BotC"), None);
    }

    #[test]
    fn test_crawl_delay_absent() {
        let robots = ParsedRobots::from_content("User-agent: *\nDisallow: /admin");
        assert_eq!(robots.crawl_delay("RippleResearch"), None);
    }
}
