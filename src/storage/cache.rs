use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crawler::canonical::CanonicalUrl;
use crate::crawler::request::CrawlParams;
use crate::crawler::task::{CrawlJob, PageResult};
use crate::storage::backend::SharedBackend;

const JOB_PREFIX: &str = "deep_scrape:cache:job:";
const PAGE_PREFIX: &str = "deep_scrape:cache:page:";

/// Stored value plus the bookkeeping needed to judge its age
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(payload: T, ttl: Duration) -> Self {
        Self {
            payload,
            created_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_seconds() >= self.ttl_secs as i64
    }
}

fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Digest of a base URL plus every output-relevant parameter
pub fn job_digest(canonical_base: &CanonicalUrl, params: &CrawlParams) -> String {
    digest(&format!("{}|{}", canonical_base, params.fingerprint()))
}

/// Key of a whole-job entry
pub fn job_key(canonical_base: &CanonicalUrl, params: &CrawlParams) -> String {
    format!("{}{}", JOB_PREFIX, job_digest(canonical_base, params))
}

/// Key of a per-page entry: the canonical URL alone
pub fn page_key(canonical_url: &CanonicalUrl) -> String {
    format!("{}{}", PAGE_PREFIX, digest(canonical_url.as_str()))
}

/// Two-tier result cache over the shared backend.
///
/// Whole-job entries hold finished crawls, per-page entries hold single
/// successful fetches. Each tier has its own TTL. Lookups never delete;
/// stale entries simply expire.
#[derive(Clone)]
pub struct ResultCache {
    backend: Arc<dyn SharedBackend>,
    job_ttl: Duration,
    page_ttl: Duration,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn SharedBackend>, job_ttl: Duration, page_ttl: Duration) -> Self {
        Self {
            backend,
            job_ttl,
            page_ttl,
        }
    }

    pub fn job_ttl(&self) -> Duration {
        self.job_ttl
    }

    pub async fn get_job(
        &self,
        canonical_base: &CanonicalUrl,
        params: &CrawlParams,
    ) -> Result<Option<CrawlJob>> {
        let key = job_key(canonical_base, params);
        let job = self.load::<CrawlJob>(&key).await?;
        if job.is_some() {
            debug!(base = %canonical_base, "Whole-job cache hit");
        }
        Ok(job)
    }

    pub async fn put_job(
        &self,
        canonical_base: &CanonicalUrl,
        params: &CrawlParams,
        job: &CrawlJob,
    ) -> Result<()> {
        let key = job_key(canonical_base, params);
        self.store(&key, job, self.job_ttl).await
    }

    pub async fn get_page(&self, canonical_url: &CanonicalUrl) -> Result<Option<PageResult>> {
        self.load::<PageResult>(&page_key(canonical_url)).await
    }

    /// Cache a page. Failed pages are never stored.
    pub async fn put_page(&self, page: &PageResult) -> Result<()> {
        if !page.is_success() {
            return Ok(());
        }
        let canonical = CanonicalUrl::from_trusted(page.url.clone());
        self.store(&page_key(&canonical), page, self.page_ttl).await
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = match self.backend.get(key).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                // treat corrupt entries as misses, the next write replaces them
                warn!("Ignoring undecodable cache entry {}: {}", key, e);
                return Ok(None);
            }
        };

        if entry.is_expired(Utc::now()) {
            return Ok(None);
        }

        Ok(Some(entry.payload))
    }

    async fn store<T: Serialize>(&self, key: &str, payload: &T, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(payload, ttl);
        let raw = serde_json::to_string(&entry).context("Failed to serialize cache entry")?;
        self.backend.set(key, &raw, Some(ttl)).await
    }
}
