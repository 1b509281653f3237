use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::crawler::error::FetchErrorKind;

/// Per-job crawl counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlMetrics {
    /// Fetches handed to the rendering service
    pub fetches: usize,

    /// Pages served from the per-page cache
    pub cache_hits: usize,

    /// Pages that ended with an error
    pub failures: usize,

    /// Fetches that never got a gate permit
    pub gate_timeouts: usize,

    /// Links refused by the filter policy
    pub links_filtered: usize,

    /// Links dropped because their canonical URL was already visited
    pub duplicates: usize,

    /// Time spent inside fetches, summed over pages
    pub fetch_time_ms: u64,

    /// Wall-clock time of the crawl
    pub elapsed_ms: u64,
}

impl CrawlMetrics {
    pub fn record_fetch(&mut self, duration_ms: u64, error: Option<FetchErrorKind>) {
        if error == Some(FetchErrorKind::ResourceExhausted) {
            self.gate_timeouts += 1;
            self.failures += 1;
            return;
        }
        self.fetches += 1;
        self.fetch_time_ms += duration_ms;
        if error.is_some() {
            self.failures += 1;
        }
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    /// Mean fetch duration over dispatched fetches
    pub fn average_fetch_ms(&self) -> u64 {
        if self.fetches == 0 {
            0
        } else {
            self.fetch_time_ms / self.fetches as u64
        }
    }
}

/// Request timer for measuring request durations
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
