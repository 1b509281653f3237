//! Deep-scrape crawl engine: breadth-first, depth-limited crawls from a base
//! URL with canonical deduplication, two-tier result caching, per-job fetch
//! gating, distributed job locks and live progress.

pub mod browser;
pub mod cli;
pub mod crawler;
pub mod storage;
pub mod utils;
