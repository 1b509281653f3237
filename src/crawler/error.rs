use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crawler::task::JobStatus;

/// Errors surfaced by the crawl engine
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Request parameters out of range; rejected before a job exists
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A single page could not be fetched or extracted
    #[error("fetch failed for {url}: {source}")]
    FetchFailure {
        url: String,
        #[source]
        source: FetchError,
    },

    /// No gate permit became available in time
    #[error("no fetch slot available after {0} ms")]
    ResourceExhausted(u64),

    /// Another execution holds the lock for this job id
    #[error("job {0} is already running")]
    AlreadyRunning(String),

    /// The job lock expired or was taken over while the job was running
    #[error("lock lost for job {0}")]
    LockLost(String),

    #[error("job {0} was cancelled")]
    Cancelled(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} has no result yet (status: {status})")]
    NotReady { id: String, status: JobStatus },

    /// Cache/queue backend fault
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl CrawlError {
    /// Job status a running job ends in when it halts with this error
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            CrawlError::Cancelled(_) => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }
}

/// Failure kinds reported by the rendering collaborator and the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Timeout,
    NetworkError,
    ExtractionFailed,
    ResourceExhausted,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::NetworkError => "network error",
            FetchErrorKind::ExtractionFailed => "extraction failed",
            FetchErrorKind::ResourceExhausted => "resource exhausted",
        };
        f.write_str(name)
    }
}

/// Per-page failure, recorded on the page instead of failing the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::NetworkError, message)
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::ExtractionFailed, message)
    }
}

impl From<CrawlError> for FetchError {
    fn from(err: CrawlError) -> Self {
        match err {
            CrawlError::FetchFailure { source, .. } => source,
            CrawlError::ResourceExhausted(_) => {
                FetchError::new(FetchErrorKind::ResourceExhausted, err.to_string())
            }
            other => FetchError::network(other.to_string()),
        }
    }
}
