use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::crawler::request::CrawlRequest;

/// Path segments that never lead to readable content
const BLOCKED_SEGMENTS: &[&str] = &[
    "login", "logout", "register", "signup", "admin", "feed", "rss", "api", "ajax",
];

/// Binary, media and asset extensions
const BLOCKED_EXTENSIONS: &str =
    r"(?i)\.(pdf|docx?|xlsx?|pptx?|zip|rar|7z|tar|gz|exe|dmg|msi|iso|jpe?g|png|gif|svg|webp|ico|mp3|mp4|avi|mov|css|js)$";

/// Why a link was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Unparseable,
    Scheme(String),
    BlockedPath,
    Excluded(String),
    ForeignHost(String),
}

/// Decides which discovered links are eligible for crawling
#[derive(Debug, Clone)]
pub struct FilterPolicy {
    /// Lower-cased host of the base URL, set when crawling stays on one host
    base_host: Option<String>,

    exclude_patterns: Vec<String>,

    blocked_extensions: Option<Regex>,
}

impl FilterPolicy {
    /// Build the policy for one request
    pub fn new(request: &CrawlRequest) -> Self {
        let base_host = if request.same_domain_only {
            Url::parse(&request.url)
                .ok()
                .and_then(|url| url.host_str().map(|host| host.to_lowercase()))
        } else {
            None
        };

        let exclude_patterns = request
            .exclude_patterns
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        Self {
            base_host,
            exclude_patterns,
            blocked_extensions: match Regex::new(BLOCKED_EXTENSIONS) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid extension pattern: {}", e);
                    None
                }
            },
        }
    }

    /// Check a raw (absolute) link against every rule
    pub fn check(&self, raw_url: &str) -> Result<Url, Rejection> {
        let url = Url::parse(raw_url).map_err(|_| Rejection::Unparseable)?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Rejection::Scheme(url.scheme().to_string()));
        }

        if self.is_blocked_path(&url) {
            return Err(Rejection::BlockedPath);
        }

        if let Some(pattern) = self.exclude_patterns.iter().find(|p| raw_url.contains(p.as_str())) {
            return Err(Rejection::Excluded(pattern.clone()));
        }

        if let Some(base_host) = &self.base_host {
            let host = url.host_str().map(|h| h.to_lowercase()).unwrap_or_default();
            if &host != base_host {
                return Err(Rejection::ForeignHost(host));
            }
        }

        Ok(url)
    }

    /// Whether a discovered link may be scheduled
    pub fn is_eligible(&self, raw_url: &str) -> bool {
        match self.check(raw_url) {
            Ok(_) => true,
            Err(reason) => {
                debug!(url = raw_url, ?reason, "Skipping link");
                false
            }
        }
    }

    fn is_blocked_path(&self, url: &Url) -> bool {
        let path = url.path();
        if self.blocked_extensions.as_ref().map_or(false, |re| re.is_match(path)) {
            return true;
        }
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .any(|segment| {
                let segment = segment.to_lowercase();
                BLOCKED_SEGMENTS.contains(&segment.as_str())
            })
    }
}

/// One-shot eligibility check
pub fn is_eligible(raw_url: &str, request: &CrawlRequest) -> bool {
    FilterPolicy::new(request).is_eligible(raw_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CrawlRequest {
        let mut request = CrawlRequest::new("https://Example.com/a/");
        request.exclude_patterns = vec!["/private".to_string(), "?print=".to_string()];
        request
    }

    #[test]
    fn test_non_http_schemes_rejected() {
        let policy = FilterPolicy::new(&request());
        assert_eq!(
            policy.check("mailto:team@example.com"),
            Err(Rejection::Scheme("mailto".to_string()))
        );
        assert!(!policy.is_eligible("tel:+15551234"));
        assert!(!policy.is_eligible("javascript:void(0)"));
        assert!(!policy.is_eligible("ftp://example.com/file"));
    }

    #[test]
    fn test_blocklist() {
        let policy = FilterPolicy::new(&request());
        assert!(!policy.is_eligible("https://example.com/admin"));
        assert!(!policy.is_eligible("https://example.com/Admin/users"));
        assert!(!policy.is_eligible("https://example.com/login?next=/"));
        assert!(!policy.is_eligible("https://example.com/api/v1/items"));
        assert!(!policy.is_eligible("https://example.com/blog/feed"));
        assert!(!policy.is_eligible("https://example.com/files/report.PDF"));
        assert!(!policy.is_eligible("https://example.com/setup.exe"));
        assert!(!policy.is_eligible("https://example.com/logo.png"));
        // segment match, not substring
        assert!(policy.is_eligible("https://example.com/administration-guide"));
        assert!(policy.is_eligible("https://example.com/b"));
    }

    #[test]
    fn test_exclude_patterns_match_raw_url() {
        let policy = FilterPolicy::new(&request());
        assert_eq!(
            policy.check("https://example.com/private/notes"),
            Err(Rejection::Excluded("/private".to_string()))
        );
        assert!(!policy.is_eligible("https://example.com/doc?print=1"));
        assert!(policy.is_eligible("https://example.com/public/notes"));
    }

    #[test]
    fn test_same_domain_only() {
        let policy = FilterPolicy::new(&request());
        assert!(policy.is_eligible("https://EXAMPLE.com/b"));
        assert_eq!(
            policy.check("https://other.org/b"),
            Err(Rejection::ForeignHost("other.org".to_string()))
        );
        assert!(!policy.is_eligible("https://blog.example.com/b"));

        let mut open = request();
        open.same_domain_only = false;
        let policy = FilterPolicy::new(&open);
        assert!(policy.is_eligible("https://other.org/b"));
        // the blocklist still applies off-site
        assert!(!policy.is_eligible("https://other.org/admin"));
    }

    #[test]
    fn test_unparseable_rejected() {
        assert!(!is_eligible("/relative/only", &request()));
        assert!(!is_eligible("http://", &request()));
    }
}
