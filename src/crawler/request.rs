use serde::{Deserialize, Serialize};
use url::Url;

use crate::crawler::error::CrawlError;

pub const MIN_DEPTH: u32 = 1;
pub const MAX_DEPTH: u32 = 10;
pub const MIN_URLS_PER_LEVEL: usize = 1;
pub const MAX_URLS_PER_LEVEL: usize = 50;
pub const MAX_DELAY_MS: u64 = 10_000;

/// A deep-scrape request. Immutable once its job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRequest {
    /// Base URL, level 0 of the crawl
    pub url: String,

    /// Deepest level to crawl (levels run 0..=max_depth)
    #[serde(default = "default_depth")]
    pub max_depth: u32,

    /// Cap on pages per level
    #[serde(default = "default_max_urls")]
    pub max_urls_per_level: usize,

    /// Only follow links on the base URL's host
    #[serde(default = "default_same_domain")]
    pub same_domain_only: bool,

    /// Substrings; any link containing one is skipped
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Minimum time between the start of two fetches of this job
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Skip cache lookups (results are still written)
    #[serde(default)]
    pub force_fresh: bool,

    /// Caller-chosen job id; derived from the request when absent
    #[serde(default)]
    pub job_id: Option<String>,

    /// Passed through to the rendering service untouched
    #[serde(default)]
    pub fetch_options: serde_json::Value,
}

fn default_depth() -> u32 {
    3
}

fn default_max_urls() -> usize {
    10
}

fn default_same_domain() -> bool {
    true
}

fn default_delay_ms() -> u64 {
    1000
}

impl CrawlRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_depth: default_depth(),
            max_urls_per_level: default_max_urls(),
            same_domain_only: default_same_domain(),
            exclude_patterns: Vec::new(),
            delay_ms: default_delay_ms(),
            force_fresh: false,
            job_id: None,
            fetch_options: serde_json::Value::Null,
        }
    }

    /// Check ranges and the base URL. Returns the parsed base URL.
    pub fn validate(&self) -> Result<Url, CrawlError> {
        let url = Url::parse(&self.url)
            .map_err(|e| CrawlError::InvalidRequest(format!("url '{}': {}", self.url, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(CrawlError::InvalidRequest(format!(
                "url '{}': only http and https are supported",
                self.url
            )));
        }
        if url.host_str().is_none() {
            return Err(CrawlError::InvalidRequest(format!("url '{}' has no host", self.url)));
        }
        if !(MIN_DEPTH..=MAX_DEPTH).contains(&self.max_depth) {
            return Err(CrawlError::InvalidRequest(format!(
                "max_depth must be between {} and {}, got {}",
                MIN_DEPTH, MAX_DEPTH, self.max_depth
            )));
        }
        if !(MIN_URLS_PER_LEVEL..=MAX_URLS_PER_LEVEL).contains(&self.max_urls_per_level) {
            return Err(CrawlError::InvalidRequest(format!(
                "max_urls_per_level must be between {} and {}, got {}",
                MIN_URLS_PER_LEVEL, MAX_URLS_PER_LEVEL, self.max_urls_per_level
            )));
        }
        if self.delay_ms > MAX_DELAY_MS {
            return Err(CrawlError::InvalidRequest(format!(
                "delay_ms must be at most {}, got {}",
                MAX_DELAY_MS, self.delay_ms
            )));
        }
        if let Some(id) = &self.job_id {
            if id.trim().is_empty() {
                return Err(CrawlError::InvalidRequest("job_id must not be blank".to_string()));
            }
        }

        Ok(url)
    }

    /// The parameters that change what a crawl produces
    pub fn params(&self) -> CrawlParams {
        let mut exclude_patterns: Vec<String> = self
            .exclude_patterns
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        exclude_patterns.sort();
        exclude_patterns.dedup();

        CrawlParams {
            max_depth: self.max_depth,
            max_urls_per_level: self.max_urls_per_level,
            same_domain_only: self.same_domain_only,
            exclude_patterns,
        }
    }
}

/// Cache-relevant subset of a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrawlParams {
    pub max_depth: u32,
    pub max_urls_per_level: usize,
    pub same_domain_only: bool,
    pub exclude_patterns: Vec<String>,
}

impl CrawlParams {
    /// Stable textual form used inside cache keys.
    ///
    /// Patterns are length-prefixed since they may contain any separator.
    pub fn fingerprint(&self) -> String {
        let exclude: String = self
            .exclude_patterns
            .iter()
            .map(|p| format!("{}:{};", p.len(), p))
            .collect();
        format!(
            "depth={};max_urls={};same_domain={};exclude={}",
            self.max_depth, self.max_urls_per_level, self.same_domain_only, exclude
        )
    }
}

/// Split a comma-separated exclude list, dropping blank entries
pub fn parse_exclude_patterns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let request = CrawlRequest::new("https://example.com/docs");
        assert!(request.validate().is_ok());
        assert_eq!(request.max_depth, 3);
        assert_eq!(request.max_urls_per_level, 10);
        assert!(request.same_domain_only);
    }

    #[test]
    fn test_out_of_range_parameters_are_rejected() {
        let mut request = CrawlRequest::new("https://example.com");
        request.max_depth = 0;
        assert!(matches!(request.validate(), Err(CrawlError::InvalidRequest(_))));

        let mut request = CrawlRequest::new("https://example.com");
        request.max_depth = 11;
        assert!(matches!(request.validate(), Err(CrawlError::InvalidRequest(_))));

        let mut request = CrawlRequest::new("https://example.com");
        request.max_urls_per_level = 51;
        assert!(matches!(request.validate(), Err(CrawlError::InvalidRequest(_))));

        let mut request = CrawlRequest::new("https://example.com");
        request.delay_ms = MAX_DELAY_MS + 1;
        assert!(matches!(request.validate(), Err(CrawlError::InvalidRequest(_))));
    }

    #[test]
    fn test_bad_base_url_is_rejected() {
        assert!(CrawlRequest::new("not a url").validate().is_err());
        assert!(CrawlRequest::new("ftp://example.com/file").validate().is_err());
        assert!(CrawlRequest::new("mailto:someone@example.com").validate().is_err());
    }

    #[test]
    fn test_params_ignore_pattern_order_and_blanks() {
        let mut a = CrawlRequest::new("https://example.com");
        a.exclude_patterns = vec!["/b".into(), "/a".into(), " ".into()];
        let mut b = CrawlRequest::new("https://example.com");
        b.exclude_patterns = vec!["/a".into(), "/b".into(), "/a".into()];
        assert_eq!(a.params(), b.params());
        assert_eq!(a.params().fingerprint(), b.params().fingerprint());
    }

    #[test]
    fn test_params_differ_on_each_relevant_field() {
        let base = CrawlRequest::new("https://example.com");
        let fp = base.params().fingerprint();

        let mut r = base.clone();
        r.max_depth = 4;
        assert_ne!(r.params().fingerprint(), fp);

        let mut r = base.clone();
        r.max_urls_per_level = 11;
        assert_ne!(r.params().fingerprint(), fp);

        let mut r = base.clone();
        r.same_domain_only = false;
        assert_ne!(r.params().fingerprint(), fp);

        let mut r = base.clone();
        r.exclude_patterns = vec!["/blog".into()];
        assert_ne!(r.params().fingerprint(), fp);

        // one pattern holding a comma is not two patterns
        let mut joined = base.clone();
        joined.exclude_patterns = vec!["/x,/y".into()];
        let mut split = base.clone();
        split.exclude_patterns = vec!["/x".into(), "/y".into()];
        assert_ne!(joined.params().fingerprint(), split.params().fingerprint());

        let mut semi = base.clone();
        semi.exclude_patterns = vec!["1:a;".into()];
        let mut plain = base.clone();
        plain.exclude_patterns = vec!["a".into()];
        assert_ne!(semi.params().fingerprint(), plain.params().fingerprint());

        // delay does not change the crawl output
        let mut r = base;
        r.delay_ms = 5;
        assert_eq!(r.params().fingerprint(), fp);
    }

    #[test]
    fn test_parse_exclude_patterns() {
        assert_eq!(
            parse_exclude_patterns("/admin, /login,,/logout "),
            vec!["/admin", "/login", "/logout"]
        );
        assert!(parse_exclude_patterns("").is_empty());
    }
}
