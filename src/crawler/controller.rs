use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::browser::PageRenderer;
use crate::cli::config::EngineConfig;
use crate::crawler::canonical::{CanonicalUrl, Canonicalizer};
use crate::crawler::error::CrawlError;
use crate::crawler::lock::JobLock;
use crate::crawler::progress::{ProgressEvent, ProgressPublisher, ProgressTracker};
use crate::crawler::request::CrawlRequest;
use crate::crawler::scheduler::{JobControl, Scheduler, SchedulerSettings};
use crate::crawler::task::{CrawlJob, JobStatus};
use crate::storage::backend::SharedBackend;
use crate::storage::cache::{job_digest, ResultCache};
use crate::storage::jobs::{JobRecord, JobStore};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const WORKER_POP_TIMEOUT: Duration = Duration::from_secs(1);

/// What a submission produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobHandle {
    pub job_id: String,
    pub status: JobStatus,
    /// Answered from the whole-job cache without crawling
    pub from_cache: bool,
}

/// Status view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub record: JobRecord,
    pub progress: Option<ProgressEvent>,
}

/// Level checkpoint: cancel flag first, then the lock lease
struct LeaseControl {
    job_id: String,
    jobs: JobStore,
    lock: JobLock,
    lost: Arc<AtomicBool>,
}

#[async_trait]
impl JobControl for LeaseControl {
    async fn checkpoint(&self, level: u32) -> Result<(), CrawlError> {
        if self.jobs.is_cancelled(&self.job_id).await? {
            return Err(CrawlError::Cancelled(self.job_id.clone()));
        }
        if self.lost.load(Ordering::SeqCst) || !self.lock.refresh().await? {
            return Err(CrawlError::LockLost(self.job_id.clone()));
        }
        debug!(job_id = %self.job_id, level, "Lease refreshed");
        Ok(())
    }
}

/// Refresh the lease in the background while levels run.
///
/// Stops and raises `lost` once another holder owns the lock; backend
/// errors are retried on the next tick.
fn spawn_heartbeat(job_id: String, lock: JobLock, lost: Arc<AtomicBool>) -> JoinHandle<()> {
    let period = (lock.ttl() / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // the first tick fires immediately; the lease is fresh at that point
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match lock.refresh().await {
                Ok(true) => debug!(job_id = %job_id, "Lease heartbeat"),
                Ok(false) => {
                    warn!(job_id = %job_id, "Lock taken over by another holder");
                    lost.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => warn!(job_id = %job_id, "Lease heartbeat failed: {:#}", e),
            }
        }
    })
}

/// A validated submission that owns its lock and still needs crawling
struct Admitted {
    record: JobRecord,
    lock: JobLock,
}

enum Admission {
    Admitted(Admitted),
    Cached(JobHandle),
}

/// Entry point for deep-scrape jobs.
///
/// Validates requests, takes the per-job lock, answers from the whole-job
/// cache when it can and otherwise runs the BFS scheduler, either in a local
/// task or through the shared work queue.
#[derive(Clone)]
pub struct JobCoordinator {
    renderer: Arc<dyn PageRenderer>,
    cache: ResultCache,
    jobs: JobStore,
    publisher: ProgressPublisher,
    canonicalizer: Arc<Canonicalizer>,
    backend: Arc<dyn SharedBackend>,
    scheduler: SchedulerSettings,
    lock_ttl: Duration,
}

impl JobCoordinator {
    pub fn new(config: &EngineConfig, backend: Arc<dyn SharedBackend>, renderer: Arc<dyn PageRenderer>) -> Self {
        Self {
            cache: ResultCache::new(backend.clone(), config.job_cache_ttl(), config.page_cache_ttl()),
            jobs: JobStore::new(
                backend.clone(),
                config.storage.queue_name.clone(),
                config.job_record_ttl(),
                config.job_cache_ttl(),
            ),
            publisher: ProgressPublisher::new(
                backend.clone(),
                config.storage.progress_channel.clone(),
                config.job_record_ttl(),
            ),
            canonicalizer: Arc::new(Canonicalizer::with_extra_params(
                config.crawler.extra_tracking_params.iter().cloned(),
            )),
            scheduler: config.gate.scheduler_settings(),
            lock_ttl: config.lock_ttl(),
            renderer,
            backend,
        }
    }

    fn canonical_base(&self, request: &CrawlRequest) -> Result<CanonicalUrl, CrawlError> {
        let base = request.validate()?;
        Ok(self.canonicalizer.canonicalize(&base))
    }

    /// Id a request runs under: the caller's, or a digest of what shapes its output
    pub fn job_id_for(&self, request: &CrawlRequest) -> Result<String, CrawlError> {
        let base = self.canonical_base(request)?;
        Ok(match &request.job_id {
            Some(id) => id.trim().to_string(),
            None => job_digest(&base, &request.params())[..16].to_string(),
        })
    }

    /// Start a job in a local task
    pub async fn submit(&self, request: CrawlRequest) -> Result<JobHandle, CrawlError> {
        match self.admit(request).await? {
            Admission::Cached(handle) => Ok(handle),
            Admission::Admitted(admitted) => {
                let handle = JobHandle {
                    job_id: admitted.record.id.clone(),
                    status: admitted.record.status,
                    from_cache: false,
                };
                let this = self.clone();
                tokio::spawn(async move {
                    let job_id = admitted.record.id.clone();
                    if let Err(e) = this.execute(admitted).await {
                        warn!(job_id = %job_id, "Job ended without completing: {}", e);
                    }
                });
                Ok(handle)
            }
        }
    }

    /// Run a job to the end in the current task
    pub async fn run(&self, request: CrawlRequest) -> Result<CrawlJob, CrawlError> {
        match self.admit(request).await? {
            Admission::Cached(handle) => self.result(&handle.job_id).await,
            Admission::Admitted(admitted) => self.execute(admitted).await,
        }
    }

    /// Queue a job for whichever worker picks it up first
    pub async fn enqueue(&self, request: CrawlRequest) -> Result<JobHandle, CrawlError> {
        match self.admit(request).await? {
            Admission::Cached(handle) => Ok(handle),
            Admission::Admitted(Admitted { record, lock }) => {
                if let Err(e) = self.jobs.enqueue(&record.id).await {
                    if let Err(release_error) = lock.release().await {
                        warn!(job_id = %record.id, "Failed to release lock: {:#}", release_error);
                    }
                    return Err(e.into());
                }
                info!(job_id = %record.id, "Job queued");
                Ok(JobHandle {
                    job_id: record.id,
                    status: JobStatus::Queued,
                    from_cache: false,
                })
            }
        }
    }

    pub async fn status(&self, job_id: &str) -> Result<JobSnapshot, CrawlError> {
        let record = self
            .jobs
            .load(job_id)
            .await?
            .ok_or_else(|| CrawlError::NotFound(job_id.to_string()))?;
        let progress = self.publisher.latest(job_id).await?;
        Ok(JobSnapshot { record, progress })
    }

    /// The finished job. Failed and cancelled jobs keep their partial levels.
    pub async fn result(&self, job_id: &str) -> Result<CrawlJob, CrawlError> {
        let record = self.jobs.load(job_id).await?;
        if let Some(record) = &record {
            if !record.status.is_terminal() {
                return Err(CrawlError::NotReady {
                    id: job_id.to_string(),
                    status: record.status,
                });
            }
        }
        match (self.jobs.load_result(job_id).await?, record) {
            (Some(job), _) => Ok(job),
            (None, Some(record)) => Err(CrawlError::NotReady {
                id: job_id.to_string(),
                status: record.status,
            }),
            (None, None) => Err(CrawlError::NotFound(job_id.to_string())),
        }
    }

    /// Ask a job to stop at its next level boundary. Finished jobs are left
    /// as they are.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, CrawlError> {
        let record = self
            .jobs
            .load(job_id)
            .await?
            .ok_or_else(|| CrawlError::NotFound(job_id.to_string()))?;

        if record.status.is_terminal() {
            debug!(job_id, status = %record.status, "Cancel ignored for finished job");
            return Ok(record.status);
        }

        self.jobs.request_cancel(job_id).await?;
        info!(job_id, "Cancellation requested");
        Ok(record.status)
    }

    /// Poll until the job finishes, or `timeout` passes when one is given
    pub async fn wait(&self, job_id: &str, timeout: Option<Duration>) -> Result<CrawlJob, CrawlError> {
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            let snapshot = self.status(job_id).await?;
            if snapshot.record.status.is_terminal() {
                return self.result(job_id).await;
            }
            if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                return Err(CrawlError::NotReady {
                    id: job_id.to_string(),
                    status: snapshot.record.status,
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Progress events for a job, ending after its terminal event
    pub async fn subscribe(&self, job_id: &str) -> Result<BoxStream<'static, ProgressEvent>, CrawlError> {
        Ok(self.publisher.subscribe(job_id).await?)
    }

    /// Take queued jobs one at a time until `shutdown` turns true
    pub async fn run_worker(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker, "Worker started");

        while !*shutdown.borrow() {
            let next = tokio::select! {
                popped = self.jobs.dequeue(WORKER_POP_TIMEOUT) => popped,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let job_id = match next {
                Ok(Some(job_id)) => job_id,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker, "Failed to read job queue: {:#}", e);
                    tokio::time::sleep(WORKER_POP_TIMEOUT).await;
                    continue;
                }
            };

            match self.claim(&job_id).await {
                Ok(Some(admitted)) => {
                    debug!(worker, job_id = %job_id, "Processing job");
                    if let Err(e) = self.execute(admitted).await {
                        warn!(worker, job_id = %job_id, "Job ended without completing: {}", e);
                    }
                }
                Ok(None) => warn!(worker, job_id = %job_id, "Dropping queued job without a live record"),
                Err(e) => error!(worker, job_id = %job_id, "Failed to claim job: {}", e),
            }
        }

        info!(worker, "Worker stopped");
    }

    /// Rebuild a queued job from its record and the lock token it carries
    async fn claim(&self, job_id: &str) -> Result<Option<Admitted>, CrawlError> {
        let record = match self.jobs.load(job_id).await? {
            Some(record) if !record.status.is_terminal() => record,
            _ => return Ok(None),
        };
        let token = match record.lock_token.clone() {
            Some(token) => token,
            None => return Ok(None),
        };
        let lock = JobLock::resume(self.backend.clone(), job_id, token, self.lock_ttl);
        Ok(Some(Admitted { record, lock }))
    }

    /// Validate, lock, and try the whole-job cache
    async fn admit(&self, request: CrawlRequest) -> Result<Admission, CrawlError> {
        let base = self.canonical_base(&request)?;
        let job_id = self.job_id_for(&request)?;

        let lock = JobLock::acquire(self.backend.clone(), &job_id, self.lock_ttl)
            .await?
            .ok_or_else(|| CrawlError::AlreadyRunning(job_id.clone()))?;

        match self.admit_locked(&job_id, &base, request, &lock).await {
            Ok(Some(record)) => Ok(Admission::Admitted(Admitted { record, lock })),
            Ok(None) => {
                lock.release().await?;
                Ok(Admission::Cached(JobHandle {
                    job_id,
                    status: JobStatus::Completed,
                    from_cache: true,
                }))
            }
            Err(e) => {
                if let Err(release_error) = lock.release().await {
                    warn!(job_id = %job_id, "Failed to release lock: {:#}", release_error);
                }
                Err(e)
            }
        }
    }

    /// `None` when the request was answered from the whole-job cache
    async fn admit_locked(
        &self,
        job_id: &str,
        base: &CanonicalUrl,
        request: CrawlRequest,
        lock: &JobLock,
    ) -> Result<Option<JobRecord>, CrawlError> {
        let params = request.params();
        let mut record = JobRecord::new(job_id, request, base.as_str());

        if !record.request.force_fresh {
            if let Some(mut job) = self.cache.get_job(base, &params).await? {
                info!(job_id, base = %base, "Answered from whole-job cache");
                job.id = job_id.to_string();
                job.request = record.request.clone();

                self.jobs.save_result(&job).await?;
                record.total_pages = job.total_pages;
                record.started_at = Some(Utc::now());
                record.mark_finished(JobStatus::Completed, None);
                self.jobs.save(&record).await?;

                let mut tracker = ProgressTracker::new(job_id, record.request.max_depth, record.request.max_urls_per_level);
                if let Some(event) = tracker.finish(JobStatus::Completed, None) {
                    self.publisher.publish(&event).await;
                }
                return Ok(None);
            }
        }

        // the id may be reused: drop what an earlier run left behind
        self.jobs.clear_cancel(job_id).await?;
        self.jobs.clear_result(job_id).await?;
        self.publisher.clear(job_id).await?;
        record.lock_token = Some(lock.token().to_string());
        self.jobs.save(&record).await?;
        Ok(Some(record))
    }

    /// Crawl an admitted job and publish its outcome
    async fn execute(&self, admitted: Admitted) -> Result<CrawlJob, CrawlError> {
        let Admitted { mut record, lock } = admitted;
        let job_id = record.id.clone();

        record.mark_running();
        if let Err(e) = self.jobs.save(&record).await {
            error!(job_id = %job_id, "Failed to mark job running: {:#}", e);
            let halt = CrawlError::from(e);
            let mut tracker = ProgressTracker::new(job_id.as_str(), record.request.max_depth, record.request.max_urls_per_level);
            self.finish_record(&mut record, &lock, &mut tracker, Some(&halt)).await;
            return Err(halt);
        }
        info!(job_id = %job_id, url = %record.request.url, "Job started");

        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = spawn_heartbeat(job_id.clone(), lock.clone(), lost.clone());
        let control = Arc::new(LeaseControl {
            job_id: job_id.clone(),
            jobs: self.jobs.clone(),
            lock: lock.clone(),
            lost: lost.clone(),
        });
        let scheduler = Scheduler::new(
            job_id.as_str(),
            record.request.clone(),
            self.canonicalizer.clone(),
            self.cache.clone(),
            self.renderer.clone(),
            self.publisher.clone(),
            control,
            &self.scheduler,
        );
        let report = scheduler.run().await;
        heartbeat.abort();
        // stopped for good before the lock is released below
        if let Err(e) = heartbeat.await {
            if !e.is_cancelled() {
                warn!(job_id = %job_id, "Lease heartbeat ended abnormally: {}", e);
            }
        }

        let total_pages = report.total_pages();
        let mut halted = report.halted;
        if halted.is_none() {
            // the result is only published while the lease is still ours
            halted = if lost.load(Ordering::SeqCst) {
                Some(CrawlError::LockLost(job_id.clone()))
            } else {
                match lock.refresh().await {
                    Ok(true) => None,
                    Ok(false) => Some(CrawlError::LockLost(job_id.clone())),
                    Err(e) => Some(CrawlError::from(e)),
                }
            };
        }

        let status = halted.as_ref().map_or(JobStatus::Completed, |e| e.terminal_status());
        let job = CrawlJob {
            id: job_id.clone(),
            domain: url::Url::parse(&record.base_url)
                .ok()
                .and_then(|url| url.host_str().map(str::to_string))
                .unwrap_or_default(),
            base_url: record.base_url.clone(),
            request: record.request.clone(),
            status,
            levels: report.levels,
            total_pages,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: Some(Utc::now()),
            error: halted.as_ref().map(|e| e.to_string()),
            stats: report.metrics,
        };

        if status == JobStatus::Completed {
            let base = CanonicalUrl::from_trusted(record.base_url.clone());
            if let Err(e) = self.cache.put_job(&base, &record.request.params(), &job).await {
                warn!(job_id = %job_id, "Failed to cache job result: {:#}", e);
            }
        }
        if let Err(e) = self.jobs.save_result(&job).await {
            error!(job_id = %job_id, "Failed to store job result: {:#}", e);
        }

        record.total_pages = total_pages;
        let mut tracker = report.tracker;
        self.finish_record(&mut record, &lock, &mut tracker, halted.as_ref()).await;

        info!(
            job_id = %job_id,
            status = %status,
            pages = total_pages,
            fetches = job.stats.fetches,
            cache_hits = job.stats.cache_hits,
            failures = job.stats.failures,
            elapsed_ms = job.stats.elapsed_ms,
            "Job finished"
        );

        match halted {
            None => Ok(job),
            Some(e) => Err(e),
        }
    }

    /// Terminal bookkeeping shared by every way a job can end
    async fn finish_record(
        &self,
        record: &mut JobRecord,
        lock: &JobLock,
        tracker: &mut ProgressTracker,
        halted: Option<&CrawlError>,
    ) {
        let status = halted.map_or(JobStatus::Completed, |e| e.terminal_status());
        let error = halted.map(|e| e.to_string());

        record.mark_finished(status, error.clone());
        if let Err(e) = self.jobs.save(record).await {
            error!(job_id = %record.id, "Failed to store final job record: {:#}", e);
        }
        if let Err(e) = self.jobs.clear_cancel(&record.id).await {
            warn!(job_id = %record.id, "Failed to clear cancel flag: {:#}", e);
        }
        if let Some(event) = tracker.finish(status, error) {
            self.publisher.publish(&event).await;
        }
        if let Err(e) = lock.release().await {
            warn!(job_id = %record.id, "Failed to release lock: {:#}", e);
        }
    }
}
