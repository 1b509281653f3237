use anyhow::{Context, Result};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crawler::task::JobStatus;
use crate::storage::backend::SharedBackend;

const SNAPSHOT_PREFIX: &str = "deep_scrape_progress:";

/// One progress update for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub percent: u8,
    pub current_level: u32,
    /// 1-based position of the last processed page within its level
    pub current_page: usize,
    pub pages_in_level: usize,
    pub total_levels: u32,
    pub pages_processed: usize,
    pub total_estimated: usize,
    pub last_url: Option<String>,
    pub error: Option<String>,
}

impl ProgressEvent {
    /// The last event a job emits
    pub fn is_terminal(&self) -> bool {
        self.percent >= 100 || self.status.is_terminal()
    }
}

/// Pub/sub envelope so one channel can carry every job
#[derive(Debug, Serialize, Deserialize)]
struct ProgressMessage {
    job_id: String,
    progress: ProgressEvent,
}

/// Turns scheduler advances into progress events.
///
/// The total is not known upfront: each later level is estimated from the
/// size of the level being processed, capped at the per-level limit. The
/// percentage never decreases and stays below 100 until `finish`.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    job_id: String,
    max_depth: u32,
    max_urls_per_level: usize,
    processed: usize,
    current_level: u32,
    level_size: usize,
    level_done: usize,
    last_percent: u8,
    last_url: Option<String>,
    finished: bool,
}

impl ProgressTracker {
    pub fn new(job_id: impl Into<String>, max_depth: u32, max_urls_per_level: usize) -> Self {
        Self {
            job_id: job_id.into(),
            max_depth,
            max_urls_per_level: max_urls_per_level.max(1),
            processed: 0,
            current_level: 0,
            level_size: 0,
            level_done: 0,
            last_percent: 0,
            last_url: None,
            finished: false,
        }
    }

    pub fn pages_processed(&self) -> usize {
        self.processed
    }

    pub fn begin_level(&mut self, level: u32, size: usize) {
        self.current_level = level;
        self.level_size = size;
        self.level_done = 0;
    }

    fn total_estimated(&self) -> usize {
        let remaining_in_level = self.level_size.saturating_sub(self.level_done);
        let later_levels = self.max_depth.saturating_sub(self.current_level) as usize;
        let per_level = self.level_size.clamp(1, self.max_urls_per_level);
        self.processed + remaining_in_level + later_levels * per_level
    }

    fn event(&self, status: JobStatus, percent: u8, error: Option<String>) -> ProgressEvent {
        ProgressEvent {
            job_id: self.job_id.clone(),
            status,
            percent,
            current_level: self.current_level,
            current_page: self.level_done,
            pages_in_level: self.level_size,
            total_levels: self.max_depth + 1,
            pages_processed: self.processed,
            total_estimated: self.total_estimated().max(self.processed),
            last_url: self.last_url.clone(),
            error,
        }
    }

    /// Record one processed page (fetched, cached or failed)
    pub fn page_processed(&mut self, url: &str) -> ProgressEvent {
        self.processed += 1;
        self.level_done += 1;
        self.last_url = Some(url.to_string());

        let total = self.total_estimated().max(1);
        let raw = (self.processed * 100 / total).min(99) as u8;
        self.last_percent = self.last_percent.max(raw);

        self.event(JobStatus::Running, self.last_percent, None)
    }

    /// The single 100% event. Returns `None` once it has been produced.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        self.last_percent = 100;
        self.level_size = self.level_done;
        Some(self.event(status, 100, error))
    }
}

/// Best-effort fan-out of progress events over the shared backend.
///
/// The latest event per job is also stored so late subscribers get a
/// starting snapshot.
#[derive(Clone)]
pub struct ProgressPublisher {
    backend: Arc<dyn SharedBackend>,
    channel: String,
    snapshot_ttl: Duration,
}

impl ProgressPublisher {
    pub fn new(backend: Arc<dyn SharedBackend>, channel: impl Into<String>, snapshot_ttl: Duration) -> Self {
        Self {
            backend,
            channel: channel.into(),
            snapshot_ttl,
        }
    }

    fn snapshot_key(job_id: &str) -> String {
        format!("{}{}", SNAPSHOT_PREFIX, job_id)
    }

    /// Publish an event. Delivery failures are logged, never propagated.
    pub async fn publish(&self, event: &ProgressEvent) {
        if let Err(e) = self.try_publish(event).await {
            warn!(job_id = %event.job_id, "Failed to publish progress: {:#}", e);
        }
    }

    async fn try_publish(&self, event: &ProgressEvent) -> Result<()> {
        let snapshot = serde_json::to_string(event).context("Failed to serialize progress")?;
        self.backend
            .set(&Self::snapshot_key(&event.job_id), &snapshot, Some(self.snapshot_ttl))
            .await?;

        let message = serde_json::to_string(&ProgressMessage {
            job_id: event.job_id.clone(),
            progress: event.clone(),
        })
        .context("Failed to serialize progress message")?;
        self.backend.publish(&self.channel, &message).await?;

        debug!(job_id = %event.job_id, percent = event.percent, "Published progress");
        Ok(())
    }

    /// Most recent event for a job
    pub async fn latest(&self, job_id: &str) -> Result<Option<ProgressEvent>> {
        let raw = self.backend.get(&Self::snapshot_key(job_id)).await?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    /// Stream a job's events, starting with the stored snapshot and ending
    /// after the terminal event. Intermediate events may be missed.
    pub async fn subscribe(&self, job_id: &str) -> Result<BoxStream<'static, ProgressEvent>> {
        // subscribe before reading the snapshot so nothing falls in between
        let messages = self.backend.subscribe(&self.channel).await?;
        let snapshot = self.latest(job_id).await?;

        if let Some(event) = &snapshot {
            if event.is_terminal() {
                return Ok(stream::iter(vec![event.clone()]).boxed());
            }
        }

        let wanted = job_id.to_string();
        let live = messages.filter_map(move |raw| {
            let wanted = wanted.clone();
            async move {
                let message: ProgressMessage = serde_json::from_str(&raw).ok()?;
                (message.job_id == wanted).then_some(message.progress)
            }
        });

        let events = stream::iter(snapshot).chain(live).boxed();
        // stop before polling again: nothing may follow the terminal event
        let until_terminal = stream::unfold(Some(events), |state| async move {
            let mut events = state?;
            let event = events.next().await?;
            let rest = (!event.is_terminal()).then_some(events);
            Some((event, rest))
        })
        .boxed();

        Ok(until_terminal)
    }

    /// Drop the stored snapshot so a rerun starts from a clean slate
    pub async fn clear(&self, job_id: &str) -> Result<()> {
        self.backend.delete(&Self::snapshot_key(job_id)).await
    }
}
