use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crawler::error::FetchError;
use crate::crawler::request::CrawlRequest;
use crate::utils::metrics::CrawlMetrics;

/// Lifecycle of a crawl job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the job can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Extracted page as returned by the rendering service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderedPage {
    /// Final URL after redirects, if the service reports one
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub text_content: Option<String>,
    /// Links in page-source order, possibly relative
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// One crawled page inside a level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// Canonical URL, the page's identity
    pub url: String,

    /// URL as first discovered
    pub raw_url: String,

    pub title: Option<String>,
    pub content: Option<String>,
    pub text_content: Option<String>,

    #[serde(default)]
    pub meta: serde_json::Value,

    /// Discovery level, 0 for the base URL
    pub level: u32,

    /// Index of the parent page in the previous level, -1 for the root
    pub parent_index: i64,

    /// Absolute outbound links in page-source order
    pub links: Vec<String>,

    pub fetch_duration_ms: u64,

    /// Served from the per-page cache
    #[serde(default)]
    pub from_cache: bool,

    pub error: Option<FetchError>,
}

impl PageResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Pages found at one link distance from the base URL, in discovery order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub level: u32,
    pub pages: Vec<PageResult>,
}

/// A deep-scrape job and, once finished, its page tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: String,
    pub request: CrawlRequest,
    pub status: JobStatus,

    /// Canonical base URL
    pub base_url: String,

    /// Host of the base URL
    pub domain: String,

    pub levels: Vec<Level>,
    pub total_pages: usize,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub error: Option<String>,

    #[serde(default)]
    pub stats: CrawlMetrics,
}

impl CrawlJob {
    /// Iterate over every page of every level
    pub fn pages(&self) -> impl Iterator<Item = &PageResult> {
        self.levels.iter().flat_map(|level| level.pages.iter())
    }

    /// Look up a page by canonical URL
    pub fn page(&self, canonical_url: &str) -> Option<&PageResult> {
        self.pages().find(|page| page.url == canonical_url)
    }
}
