use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::PageRenderer;
use crate::crawler::canonical::{CanonicalUrl, Canonicalizer};
use crate::crawler::error::{CrawlError, FetchError};
use crate::crawler::filter::FilterPolicy;
use crate::crawler::gate::ConcurrencyGate;
use crate::crawler::progress::{ProgressPublisher, ProgressTracker};
use crate::crawler::request::CrawlRequest;
use crate::crawler::task::{Level, PageResult, RenderedPage};
use crate::storage::cache::ResultCache;
use crate::utils::metrics::{CrawlMetrics, RequestTimer};

/// Checked at the top of every level; an error stops the crawl there
#[async_trait]
pub trait JobControl: Send + Sync {
    async fn checkpoint(&self, level: u32) -> Result<(), CrawlError>;
}

/// Control that never interrupts
pub struct Unsupervised;

#[async_trait]
impl JobControl for Unsupervised {
    async fn checkpoint(&self, _level: u32) -> Result<(), CrawlError> {
        Ok(())
    }
}

/// Gate and timeout settings for one crawl
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_in_flight: usize,
    pub acquire_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            acquire_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

/// What the scheduler hands back when it stops
pub struct CrawlReport {
    pub levels: Vec<Level>,
    pub metrics: CrawlMetrics,
    pub tracker: ProgressTracker,
    /// Set when the crawl stopped before its frontier was exhausted
    pub halted: Option<CrawlError>,
}

impl CrawlReport {
    pub fn total_pages(&self) -> usize {
        self.levels.iter().map(|level| level.pages.len()).sum()
    }
}

/// A URL waiting to be fetched at the current level
#[derive(Debug, Clone)]
struct FrontierEntry {
    raw_url: String,
    canonical: CanonicalUrl,
    parent_index: i64,
}

enum FetchOutcome {
    Cached(PageResult),
    Rendered { page: RenderedPage, duration_ms: u64 },
    Failed { error: FetchError, duration_ms: u64 },
}

/// Everything a fetch needs; shared read-only by the concurrent fetches of
/// a level
struct Fetcher {
    renderer: Arc<dyn PageRenderer>,
    cache: ResultCache,
    gate: ConcurrencyGate,
    fetch_timeout: Duration,
    fetch_options: serde_json::Value,
    use_cache: bool,
}

impl Fetcher {
    async fn fetch(&self, entry: &FrontierEntry) -> FetchOutcome {
        if self.use_cache {
            match self.cache.get_page(&entry.canonical).await {
                Ok(Some(page)) => return FetchOutcome::Cached(page),
                Ok(None) => {}
                Err(e) => warn!(url = %entry.canonical, "Page cache lookup failed: {:#}", e),
            }
        }

        let permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return FetchOutcome::Failed {
                    error: FetchError::from(e),
                    duration_ms: 0,
                }
            }
        };

        let timer = RequestTimer::start();
        let result = tokio::time::timeout(
            self.fetch_timeout,
            self.renderer.fetch_and_extract(&entry.raw_url, &self.fetch_options),
        )
        .await;
        let duration_ms = timer.end();
        permit.release();

        match result {
            Ok(Ok(page)) => FetchOutcome::Rendered { page, duration_ms },
            Ok(Err(error)) => FetchOutcome::Failed { error, duration_ms },
            Err(_) => FetchOutcome::Failed {
                error: FetchError::timeout(format!(
                    "no response within {} ms",
                    self.fetch_timeout.as_millis()
                )),
                duration_ms,
            },
        }
    }
}

/// Resolve page links against the page URL, keeping source order
fn absolute_links(page_url: &str, links: &[String]) -> Vec<String> {
    let base = match Url::parse(page_url) {
        Ok(base) => base,
        Err(_) => return Vec::new(),
    };
    links
        .iter()
        .filter_map(|link| base.join(link.trim()).ok())
        .map(|url| url.to_string())
        .collect()
}

/// Breadth-first crawl of one job.
///
/// Owns the visited set and the frontier; fetch futures only read shared
/// state and hand their outcome back, and the scheduler integrates results
/// between fan-out and fan-in.
pub struct Scheduler {
    job_id: String,
    request: CrawlRequest,
    canonicalizer: Arc<Canonicalizer>,
    filter: FilterPolicy,
    fetcher: Fetcher,
    publisher: ProgressPublisher,
    control: Arc<dyn JobControl>,
    tracker: ProgressTracker,
    visited: HashSet<CanonicalUrl>,
    metrics: CrawlMetrics,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: impl Into<String>,
        request: CrawlRequest,
        canonicalizer: Arc<Canonicalizer>,
        cache: ResultCache,
        renderer: Arc<dyn PageRenderer>,
        publisher: ProgressPublisher,
        control: Arc<dyn JobControl>,
        settings: &SchedulerSettings,
    ) -> Self {
        let job_id = job_id.into();
        let gate = ConcurrencyGate::new(
            settings.max_in_flight,
            Duration::from_millis(request.delay_ms),
            settings.acquire_timeout,
        );
        let fetcher = Fetcher {
            renderer,
            cache,
            gate,
            fetch_timeout: settings.fetch_timeout,
            fetch_options: request.fetch_options.clone(),
            use_cache: !request.force_fresh,
        };

        Self {
            tracker: ProgressTracker::new(job_id.clone(), request.max_depth, request.max_urls_per_level),
            filter: FilterPolicy::new(&request),
            job_id,
            request,
            canonicalizer,
            fetcher,
            publisher,
            control,
            visited: HashSet::new(),
            metrics: CrawlMetrics::default(),
        }
    }

    /// Run the crawl until the depth limit, an empty frontier, or a halt
    pub async fn run(mut self) -> CrawlReport {
        let timer = RequestTimer::start();
        let mut levels: Vec<Level> = Vec::new();
        let mut halted = None;

        match Url::parse(&self.request.url) {
            Ok(base) => {
                let canonical = self.canonicalizer.canonicalize(&base);
                self.visited.insert(canonical.clone());
                let mut frontier = vec![FrontierEntry {
                    raw_url: self.request.url.clone(),
                    canonical,
                    parent_index: -1,
                }];

                for depth in 0..=self.request.max_depth {
                    if frontier.is_empty() {
                        break;
                    }
                    if let Err(e) = self.control.checkpoint(depth).await {
                        info!(job_id = %self.job_id, level = depth, "Crawl halted: {}", e);
                        halted = Some(e);
                        break;
                    }

                    frontier.truncate(self.request.max_urls_per_level);
                    info!(
                        job_id = %self.job_id,
                        level = depth,
                        urls = frontier.len(),
                        "Processing level"
                    );

                    let pages = self.process_level(depth, &frontier).await;
                    frontier = if depth < self.request.max_depth {
                        self.discover(&pages)
                    } else {
                        Vec::new()
                    };
                    levels.push(Level { level: depth, pages });
                }
            }
            Err(e) => {
                halted = Some(CrawlError::InvalidRequest(format!("url '{}': {}", self.request.url, e)));
            }
        }

        self.metrics.elapsed_ms = timer.end();
        CrawlReport {
            levels,
            metrics: self.metrics,
            tracker: self.tracker,
            halted,
        }
    }

    /// Fetch one level concurrently and return its pages in frontier order
    async fn process_level(&mut self, depth: u32, frontier: &[FrontierEntry]) -> Vec<PageResult> {
        self.tracker.begin_level(depth, frontier.len());

        let fetcher = &self.fetcher;
        let mut pending: FuturesUnordered<_> = frontier
            .iter()
            .enumerate()
            .map(|(index, entry)| async move { (index, fetcher.fetch(entry).await) })
            .collect();

        // completion order is arbitrary; slots restore discovery order
        let mut slots: Vec<Option<PageResult>> = vec![None; frontier.len()];

        while let Some((index, outcome)) = pending.next().await {
            let entry = &frontier[index];
            let page = match outcome {
                FetchOutcome::Cached(mut page) => {
                    self.metrics.record_cache_hit();
                    page.raw_url = entry.raw_url.clone();
                    page.level = depth;
                    page.parent_index = entry.parent_index;
                    page.fetch_duration_ms = 0;
                    page.from_cache = true;
                    debug!(url = %entry.canonical, "Served from page cache");
                    page
                }
                FetchOutcome::Rendered { page, duration_ms } => {
                    self.metrics.record_fetch(duration_ms, None);
                    let page_url = page.url.as_deref().unwrap_or(&entry.raw_url);
                    let links = absolute_links(page_url, &page.links);
                    let result = PageResult {
                        url: entry.canonical.to_string(),
                        raw_url: entry.raw_url.clone(),
                        title: page.title,
                        content: page.content,
                        text_content: page.text_content,
                        meta: page.meta,
                        level: depth,
                        parent_index: entry.parent_index,
                        links,
                        fetch_duration_ms: duration_ms,
                        from_cache: false,
                        error: None,
                    };
                    if let Err(e) = fetcher.cache.put_page(&result).await {
                        warn!(url = %entry.canonical, "Failed to cache page: {:#}", e);
                    }
                    result
                }
                FetchOutcome::Failed { error, duration_ms } => {
                    self.metrics.record_fetch(duration_ms, Some(error.kind));
                    warn!(job_id = %self.job_id, url = %entry.raw_url, "Page failed: {}", error);
                    PageResult {
                        url: entry.canonical.to_string(),
                        raw_url: entry.raw_url.clone(),
                        title: None,
                        content: None,
                        text_content: None,
                        meta: serde_json::Value::Null,
                        level: depth,
                        parent_index: entry.parent_index,
                        links: Vec::new(),
                        fetch_duration_ms: duration_ms,
                        from_cache: false,
                        error: Some(error),
                    }
                }
            };

            let event = self.tracker.page_processed(&entry.raw_url);
            self.publisher.publish(&event).await;
            slots[index] = Some(page);
        }

        slots.into_iter().flatten().collect()
    }

    /// Build the next frontier from the links of a finished level
    fn discover(&mut self, pages: &[PageResult]) -> Vec<FrontierEntry> {
        let cap = self.request.max_urls_per_level;
        let mut next = Vec::new();

        'pages: for (parent_index, page) in pages.iter().enumerate() {
            if !page.is_success() {
                continue;
            }
            for link in &page.links {
                if next.len() >= cap {
                    break 'pages;
                }
                let url = match self.filter.check(link) {
                    Ok(url) => url,
                    Err(reason) => {
                        debug!(url = %link, ?reason, "Skipping link");
                        self.metrics.links_filtered += 1;
                        continue;
                    }
                };
                let canonical = self.canonicalizer.canonicalize(&url);
                if !self.visited.insert(canonical.clone()) {
                    self.metrics.duplicates += 1;
                    continue;
                }
                next.push(FrontierEntry {
                    raw_url: link.clone(),
                    canonical,
                    parent_index: parent_index as i64,
                });
            }
        }

        next
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::browser::MockPageRenderer;
    use crate::crawler::error::FetchErrorKind;
    use crate::crawler::progress::ProgressEvent;
    use crate::crawler::task::JobStatus;
    use crate::storage::backend::{MemoryBackend, SharedBackend};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted site: URL -> outbound links, with per-URL failures and
    /// fetch counting
    #[derive(Default)]
    pub(crate) struct FakeSite {
        pages: HashMap<String, Vec<String>>,
        failures: HashMap<String, FetchErrorKind>,
        delays: HashMap<String, Duration>,
        fetches: AtomicUsize,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeSite {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn page(mut self, url: &str, links: &[&str]) -> Self {
            self.pages
                .insert(url.to_string(), links.iter().map(|l| l.to_string()).collect());
            self
        }

        pub(crate) fn failing(mut self, url: &str, kind: FetchErrorKind) -> Self {
            self.failures.insert(url.to_string(), kind);
            self
        }

        pub(crate) fn slow(mut self, url: &str, delay: Duration) -> Self {
            self.delays.insert(url.to_string(), delay);
            self
        }

        pub(crate) fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        pub(crate) fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageRenderer for FakeSite {
        async fn fetch_and_extract(
            &self,
            url: &str,
            _options: &serde_json::Value,
        ) -> Result<RenderedPage, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.fetched.lock().unwrap().push(url.to_string());
            if let Some(delay) = self.delays.get(url) {
                tokio::time::sleep(*delay).await;
            }
            if let Some(kind) = self.failures.get(url) {
                return Err(FetchError::new(*kind, format!("scripted failure for {}", url)));
            }
            let links = self.pages.get(url).cloned().unwrap_or_default();
            Ok(RenderedPage {
                url: Some(url.to_string()),
                title: Some(format!("Title of {}", url)),
                content: Some(format!("<p>{}</p>", url)),
                text_content: Some(url.to_string()),
                links,
                meta: serde_json::Value::Null,
            })
        }
    }

    pub(crate) fn request(url: &str, depth: u32, max_urls: usize) -> CrawlRequest {
        let mut request = CrawlRequest::new(url);
        request.max_depth = depth;
        request.max_urls_per_level = max_urls;
        request.delay_ms = 0;
        request
    }

    struct Harness {
        backend: Arc<MemoryBackend>,
        cache: ResultCache,
        publisher: ProgressPublisher,
    }

    impl Harness {
        fn new() -> Self {
            let backend = Arc::new(MemoryBackend::new());
            let shared: Arc<dyn SharedBackend> = backend.clone();
            Self {
                cache: ResultCache::new(shared.clone(), Duration::from_secs(3600), Duration::from_secs(7200)),
                publisher: ProgressPublisher::new(shared, "progress", Duration::from_secs(60)),
                backend,
            }
        }

        fn scheduler(&self, request: CrawlRequest, renderer: Arc<dyn PageRenderer>) -> Scheduler {
            self.scheduler_with(request, renderer, Arc::new(Unsupervised), SchedulerSettings::default())
        }

        fn scheduler_with(
            &self,
            request: CrawlRequest,
            renderer: Arc<dyn PageRenderer>,
            control: Arc<dyn JobControl>,
            settings: SchedulerSettings,
        ) -> Scheduler {
            Scheduler::new(
                "test-job",
                request,
                Arc::new(Canonicalizer::default()),
                self.cache.clone(),
                renderer,
                self.publisher.clone(),
                control,
                &settings,
            )
        }
    }

    fn urls(level: &Level) -> Vec<&str> {
        level.pages.iter().map(|p| p.url.as_str()).collect()
    }

    #[tokio::test]
    async fn test_scenario_filters_admin_and_canonicalizes_base() {
        let site = Arc::new(
            FakeSite::new()
                .page("https://Example.com/a/?utm_source=x#frag", &["/b", "/admin"])
                .page("https://example.com/b", &[]),
        );
        let harness = Harness::new();
        let report = harness
            .scheduler(request("https://Example.com/a/?utm_source=x#frag", 2, 5), site.clone())
            .run()
            .await;

        assert!(report.halted.is_none());
        assert_eq!(report.levels.len(), 2);
        assert_eq!(urls(&report.levels[0]), vec!["https://example.com/a"]);
        assert_eq!(urls(&report.levels[1]), vec!["https://example.com/b"]);
        assert_eq!(report.levels[1].pages[0].parent_index, 0);
        assert_eq!(report.levels[0].pages[0].parent_index, -1);
        assert!(site.fetched().iter().all(|u| !u.contains("admin")));
        assert_eq!(report.metrics.links_filtered, 1);
    }

    #[tokio::test]
    async fn test_depth_and_width_limits() {
        let site = Arc::new(
            FakeSite::new()
                .page("https://example.com/", &["/1", "/2", "/3", "/4"])
                .page("https://example.com/1", &["/1/a", "/1/b", "/1/c"])
                .page("https://example.com/2", &["/2/a"])
                .page("https://example.com/1/a", &["/deeper"]),
        );
        let harness = Harness::new();
        let report = harness
            .scheduler(request("https://example.com/", 2, 3), site.clone())
            .run()
            .await;

        assert!(report.levels.len() <= 3);
        for level in &report.levels {
            assert!(level.pages.len() <= 3);
        }
        assert_eq!(
            urls(&report.levels[1]),
            vec!["https://example.com/1", "https://example.com/2", "https://example.com/3"]
        );
        assert_eq!(
            urls(&report.levels[2]),
            vec!["https://example.com/1/a", "https://example.com/1/b", "https://example.com/1/c"]
        );
        // level 2 is the last one, its links are never followed
        assert!(!site.fetched().iter().any(|u| u.ends_with("/deeper")));
    }

    #[tokio::test]
    async fn test_cross_level_dedup() {
        let site = Arc::new(
            FakeSite::new()
                .page("https://example.com/", &["/a", "/b", "/a#x", "/a/"])
                .page("https://example.com/a", &["/", "/b", "/c"])
                .page("https://example.com/b", &["/a?utm_medium=mail", "/c"]),
        );
        let harness = Harness::new();
        let report = harness
            .scheduler(request("https://example.com/", 3, 10), site.clone())
            .run()
            .await;

        let mut seen = HashSet::new();
        for page in report.levels.iter().flat_map(|l| l.pages.iter()) {
            assert!(seen.insert(page.url.clone()), "duplicate page {}", page.url);
        }
        assert_eq!(urls(&report.levels[1]), vec!["https://example.com/a", "https://example.com/b"]);
        assert_eq!(urls(&report.levels[2]), vec!["https://example.com/c"]);
        assert_eq!(site.fetch_count(), 4);
        assert!(report.metrics.duplicates >= 4);
    }

    #[tokio::test]
    async fn test_parent_index_points_at_first_discoverer() {
        let site = Arc::new(
            FakeSite::new()
                .page("https://example.com/", &["/x", "/y"])
                .page("https://example.com/x", &["/x1"])
                .page("https://example.com/y", &["/y1", "/x1"]),
        );
        let harness = Harness::new();
        let report = harness
            .scheduler(request("https://example.com/", 2, 10), site)
            .run()
            .await;

        let level2 = &report.levels[2];
        assert_eq!(urls(level2), vec!["https://example.com/x1", "https://example.com/y1"]);
        assert_eq!(level2.pages[0].parent_index, 0);
        assert_eq!(level2.pages[1].parent_index, 1);
        for (depth, level) in report.levels.iter().enumerate().skip(1) {
            let parents = report.levels[depth - 1].pages.len() as i64;
            assert!(level.pages.iter().all(|p| p.parent_index >= 0 && p.parent_index < parents));
        }
    }

    #[tokio::test]
    async fn test_failed_page_keeps_siblings_and_order() {
        let site = Arc::new(
            FakeSite::new()
                .page("https://example.com/", &["/slow", "/broken", "/fast"])
                .page("https://example.com/slow", &["/from-slow"])
                .page("https://example.com/fast", &["/from-fast"])
                .failing("https://example.com/broken", FetchErrorKind::Timeout)
                .slow("https://example.com/slow", Duration::from_millis(50)),
        );
        let harness = Harness::new();
        let report = harness
            .scheduler(request("https://example.com/", 2, 10), site)
            .run()
            .await;

        assert!(report.halted.is_none());
        let level1 = &report.levels[1];
        assert_eq!(
            urls(level1),
            vec!["https://example.com/slow", "https://example.com/broken", "https://example.com/fast"]
        );
        let broken = &level1.pages[1];
        assert_eq!(broken.error.as_ref().map(|e| e.kind), Some(FetchErrorKind::Timeout));
        assert!(broken.links.is_empty());
        assert_eq!(
            urls(&report.levels[2]),
            vec!["https://example.com/from-slow", "https://example.com/from-fast"]
        );
        assert_eq!(report.metrics.failures, 1);
    }

    #[tokio::test]
    async fn test_renderer_timeout_is_a_page_error() {
        let site = Arc::new(
            FakeSite::new()
                .page("https://example.com/", &["/hang", "/ok"])
                .page("https://example.com/hang", &[])
                .page("https://example.com/ok", &[])
                .slow("https://example.com/hang", Duration::from_secs(5)),
        );
        let harness = Harness::new();
        let settings = SchedulerSettings {
            fetch_timeout: Duration::from_millis(100),
            ..SchedulerSettings::default()
        };
        let report = harness
            .scheduler_with(request("https://example.com/", 1, 10), site, Arc::new(Unsupervised), settings)
            .run()
            .await;

        let level1 = &report.levels[1];
        assert_eq!(level1.pages[0].error.as_ref().map(|e| e.kind), Some(FetchErrorKind::Timeout));
        assert!(level1.pages[1].is_success());
    }

    #[tokio::test]
    async fn test_gate_exhaustion_is_recorded_per_page() {
        let site = Arc::new(
            FakeSite::new()
                .page("https://example.com/", &["/slow", "/starved"])
                .page("https://example.com/slow", &[])
                .page("https://example.com/starved", &[])
                .slow("https://example.com/slow", Duration::from_millis(300)),
        );
        let harness = Harness::new();
        let settings = SchedulerSettings {
            max_in_flight: 1,
            acquire_timeout: Duration::from_millis(50),
            fetch_timeout: Duration::from_secs(5),
        };
        let report = harness
            .scheduler_with(request("https://example.com/", 1, 10), site, Arc::new(Unsupervised), settings)
            .run()
            .await;

        assert!(report.halted.is_none());
        let level1 = &report.levels[1];
        assert_eq!(level1.pages.iter().filter(|p| p.is_success()).count(), 1);
        let starved: Vec<_> = level1
            .pages
            .iter()
            .filter_map(|p| p.error.as_ref().map(|e| e.kind))
            .collect();
        assert_eq!(starved, vec![FetchErrorKind::ResourceExhausted]);
        assert_eq!(report.metrics.gate_timeouts, 1);
    }

    #[tokio::test]
    async fn test_warm_page_cache_only_fetches_new_pages() {
        let site = Arc::new(
            FakeSite::new()
                .page("https://example.com/", &["/a", "/b"])
                .page("https://example.com/a", &["/a1"])
                .page("https://example.com/b", &["/b1"])
                .page("https://example.com/a1", &["/a2"])
                .page("https://example.com/b1", &[]),
        );
        let harness = Harness::new();

        let shallow = harness
            .scheduler(request("https://example.com/", 1, 10), site.clone())
            .run()
            .await;
        assert_eq!(shallow.total_pages(), 3);
        assert_eq!(site.fetch_count(), 3);

        let deep = harness
            .scheduler(request("https://example.com/", 2, 10), site.clone())
            .run()
            .await;
        assert_eq!(deep.total_pages(), 5);
        // only a1 and b1 are new
        assert_eq!(site.fetch_count(), 5);
        assert_eq!(deep.metrics.cache_hits, 3);
        assert!(deep.levels[1].pages.iter().all(|p| p.from_cache));
        assert_eq!(deep.levels[1].pages[0].links, vec!["https://example.com/a1"]);
    }

    #[tokio::test]
    async fn test_force_fresh_skips_lookups_but_writes() {
        let site = Arc::new(FakeSite::new().page("https://example.com/", &[]));
        let harness = Harness::new();

        harness
            .scheduler(request("https://example.com/", 1, 10), site.clone())
            .run()
            .await;
        let mut fresh = request("https://example.com/", 1, 10);
        fresh.force_fresh = true;
        let report = harness.scheduler(fresh, site.clone()).run().await;

        assert_eq!(site.fetch_count(), 2);
        assert_eq!(report.metrics.cache_hits, 0);
        assert_eq!(harness.backend.count_prefix("deep_scrape:cache:page:"), 1);
    }

    #[tokio::test]
    async fn test_failed_pages_are_not_cached() {
        let site = Arc::new(
            FakeSite::new().failing("https://example.com/", FetchErrorKind::NetworkError),
        );
        let harness = Harness::new();
        let report = harness
            .scheduler(request("https://example.com/", 1, 10), site.clone())
            .run()
            .await;

        assert_eq!(report.levels.len(), 1);
        assert!(report.levels[0].pages[0].error.is_some());
        assert_eq!(harness.backend.count_prefix("deep_scrape:cache:page:"), 0);
    }

    struct CancelAt(u32);

    #[async_trait]
    impl JobControl for CancelAt {
        async fn checkpoint(&self, level: u32) -> Result<(), CrawlError> {
            if level >= self.0 {
                Err(CrawlError::Cancelled("test-job".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_cancellation_between_levels() {
        let site = Arc::new(
            FakeSite::new()
                .page("https://example.com/", &["/a"])
                .page("https://example.com/a", &["/b"]),
        );
        let harness = Harness::new();
        let report = harness
            .scheduler_with(
                request("https://example.com/", 3, 10),
                site.clone(),
                Arc::new(CancelAt(1)),
                SchedulerSettings::default(),
            )
            .run()
            .await;

        assert!(matches!(report.halted, Some(CrawlError::Cancelled(_))));
        assert_eq!(report.levels.len(), 1);
        assert_eq!(site.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_progress_events_per_page() {
        let mut links: Vec<String> = Vec::new();
        for i in 0..9 {
            links.push(format!("/p{}", i));
        }
        let link_refs: Vec<&str> = links.iter().map(|s| s.as_str()).collect();
        let mut site = FakeSite::new().page("https://example.com/", &link_refs);
        for i in 0..9 {
            site = site.page(&format!("https://example.com/p{}", i), &[]);
        }
        let harness = Harness::new();
        let stream = harness.publisher.subscribe("test-job").await.unwrap();

        let report = harness
            .scheduler(request("https://example.com/", 2, 10), Arc::new(site))
            .run()
            .await;
        let mut tracker = report.tracker;
        harness
            .publisher
            .publish(&tracker.finish(JobStatus::Completed, None).unwrap())
            .await;

        let events: Vec<ProgressEvent> = stream.collect().await;

        assert_eq!(events.len(), 11);
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(events.iter().filter(|e| e.percent == 100).count(), 1);
        assert_eq!(events.last().unwrap().pages_processed, 10);
    }

    #[tokio::test]
    async fn test_with_mock_renderer_resolves_relative_links() {
        let mut renderer = MockPageRenderer::new();
        renderer
            .expect_fetch_and_extract()
            .withf(|url, _| url.eq_ignore_ascii_case("https://example.com/docs/"))
            .times(1)
            .returning(|_, _| {
                Ok(RenderedPage {
                    url: Some("https://example.com/docs/".to_string()),
                    links: vec!["intro".to_string(), "../blog".to_string(), "mailto:x@example.com".to_string()],
                    ..RenderedPage::default()
                })
            });
        for child in ["https://example.com/docs/intro", "https://example.com/blog"] {
            renderer
                .expect_fetch_and_extract()
                .withf(move |url, _| url.to_string() == child)
                .times(1)
                .returning(move |_, _| {
                    Ok(RenderedPage {
                        url: Some(child.to_string()),
                        ..RenderedPage::default()
                    })
                });
        }

        let harness = Harness::new();
        let report = harness
            .scheduler(request("https://example.com/docs/", 1, 10), Arc::new(renderer))
            .run()
            .await;

        assert_eq!(
            report.levels[0].pages[0].links,
            vec![
                "https://example.com/docs/intro",
                "https://example.com/blog",
                "mailto:x@example.com"
            ]
        );
        let level_one: Vec<&str> = report.levels[1].pages.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(level_one, vec!["https://example.com/docs/intro", "https://example.com/blog"]);
    }
}
