use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::crawler::request::CrawlRequest;
use crate::crawler::task::{CrawlJob, JobStatus};
use crate::storage::backend::SharedBackend;

const JOB_PREFIX: &str = "deep_scrape_job:";
const RESULT_PREFIX: &str = "deep_scrape_result:";
const CANCEL_PREFIX: &str = "deep_scrape_cancel:";

/// Lifecycle record of a job, readable by any process sharing the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub request: CrawlRequest,
    pub status: JobStatus,

    /// Canonical base URL
    pub base_url: String,

    /// Token of the lock taken at submission, handed to the executing worker
    #[serde(default)]
    pub lock_token: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,

    #[serde(default)]
    pub total_pages: usize,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, request: CrawlRequest, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            request,
            status: JobStatus::Queued,
            base_url: base_url.into(),
            lock_token: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            total_pages: 0,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_finished(&mut self, status: JobStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
        self.lock_token = None;
    }
}

/// Job records, finished results, cancel flags and the work queue
#[derive(Clone)]
pub struct JobStore {
    backend: Arc<dyn SharedBackend>,
    queue: String,
    record_ttl: Duration,
    result_ttl: Duration,
}

impl JobStore {
    pub fn new(
        backend: Arc<dyn SharedBackend>,
        queue: impl Into<String>,
        record_ttl: Duration,
        result_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            queue: queue.into(),
            record_ttl,
            result_ttl,
        }
    }

    pub async fn save(&self, record: &JobRecord) -> Result<()> {
        let raw = serde_json::to_string(record).context("Failed to serialize job record")?;
        self.backend
            .set(&format!("{}{}", JOB_PREFIX, record.id), &raw, Some(self.record_ttl))
            .await
    }

    pub async fn load(&self, job_id: &str) -> Result<Option<JobRecord>> {
        match self.backend.get(&format!("{}{}", JOB_PREFIX, job_id)).await? {
            Some(raw) => {
                let record = serde_json::from_str(&raw)
                    .context(format!("Failed to parse job record {}", job_id))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub async fn save_result(&self, job: &CrawlJob) -> Result<()> {
        let raw = serde_json::to_string(job).context("Failed to serialize crawl result")?;
        self.backend
            .set(&format!("{}{}", RESULT_PREFIX, job.id), &raw, Some(self.result_ttl))
            .await?;
        debug!(job_id = %job.id, pages = job.total_pages, "Stored crawl result");
        Ok(())
    }

    pub async fn load_result(&self, job_id: &str) -> Result<Option<CrawlJob>> {
        match self.backend.get(&format!("{}{}", RESULT_PREFIX, job_id)).await? {
            Some(raw) => {
                let job = serde_json::from_str(&raw)
                    .context(format!("Failed to parse crawl result {}", job_id))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Forget a previous run's result before the id is reused
    pub async fn clear_result(&self, job_id: &str) -> Result<()> {
        self.backend.delete(&format!("{}{}", RESULT_PREFIX, job_id)).await
    }

    /// Flag a job for cooperative cancellation
    pub async fn request_cancel(&self, job_id: &str) -> Result<()> {
        self.backend
            .set(&format!("{}{}", CANCEL_PREFIX, job_id), "1", Some(self.record_ttl))
            .await
    }

    pub async fn is_cancelled(&self, job_id: &str) -> Result<bool> {
        Ok(self
            .backend
            .get(&format!("{}{}", CANCEL_PREFIX, job_id))
            .await?
            .is_some())
    }

    pub async fn clear_cancel(&self, job_id: &str) -> Result<()> {
        self.backend.delete(&format!("{}{}", CANCEL_PREFIX, job_id)).await
    }

    /// Hand a job id to the worker pool
    pub async fn enqueue(&self, job_id: &str) -> Result<()> {
        self.backend.push(&self.queue, job_id).await?;
        debug!(job_id, queue = %self.queue, "Queued job");
        Ok(())
    }

    /// Next queued job id, or `None` after `timeout`
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<String>> {
        self.backend.pop(&self.queue, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryBackend;

    fn store() -> JobStore {
        JobStore::new(
            Arc::new(MemoryBackend::new()),
            "jobs",
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_record_lifecycle() {
        let store = store();
        let mut record = JobRecord::new("job-1", CrawlRequest::new("https://example.com"), "https://example.com/");
        store.save(&record).await.unwrap();

        record.mark_running();
        record.lock_token = Some("token".into());
        store.save(&record).await.unwrap();
        let loaded = store.load("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.lock_token.as_deref(), Some("token"));

        record.mark_finished(JobStatus::Failed, Some("boom".into()));
        store.save(&record).await.unwrap();
        let loaded = store.load("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert!(loaded.lock_token.is_none());
        assert!(loaded.finished_at.is_some());

        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_result() {
        let store = store();
        let record = JobRecord::new("job-1", CrawlRequest::new("https://example.com"), "https://example.com/");
        let job = CrawlJob {
            id: record.id.clone(),
            domain: "example.com".into(),
            base_url: record.base_url.clone(),
            request: record.request.clone(),
            status: JobStatus::Completed,
            levels: Vec::new(),
            total_pages: 0,
            created_at: record.created_at,
            started_at: None,
            finished_at: None,
            error: None,
            stats: Default::default(),
        };
        store.save_result(&job).await.unwrap();
        assert!(store.load_result("job-1").await.unwrap().is_some());

        store.clear_result("job-1").await.unwrap();
        assert!(store.load_result("job-1").await.unwrap().is_none());
    }

    #[test]
    fn test_cancel_flag() {
        let store = store();
        tokio_test::block_on(async {
            assert!(!store.is_cancelled("job").await.unwrap());
            store.request_cancel("job").await.unwrap();
            assert!(store.is_cancelled("job").await.unwrap());
            store.clear_cancel("job").await.unwrap();
            assert!(!store.is_cancelled("job").await.unwrap());
        });
    }

    #[tokio::test]
    async fn test_queue_order() {
        let store = store();
        store.enqueue("a").await.unwrap();
        store.enqueue("b").await.unwrap();
        assert_eq!(store.dequeue(Duration::from_millis(10)).await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.dequeue(Duration::from_millis(10)).await.unwrap().as_deref(), Some("b"));
        assert!(store.dequeue(Duration::from_millis(10)).await.unwrap().is_none());
    }
}
