use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::backend::SharedBackend;

const LOCK_PREFIX: &str = "deep_scrape:lock:";

/// Exclusive, expiring ownership of a job id across all workers
#[derive(Clone)]
pub struct JobLock {
    backend: Arc<dyn SharedBackend>,
    key: String,
    token: String,
    ttl: Duration,
}

impl std::fmt::Debug for JobLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLock")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl JobLock {
    fn key_for(job_id: &str) -> String {
        format!("{}{}", LOCK_PREFIX, job_id)
    }

    /// Try to take the lock. `None` means someone else holds it.
    pub async fn acquire(
        backend: Arc<dyn SharedBackend>,
        job_id: &str,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        let key = Self::key_for(job_id);
        let token = Uuid::new_v4().to_string();

        if !backend.set_nx(&key, &token, ttl).await? {
            debug!(job_id, "Lock already held");
            return Ok(None);
        }

        Ok(Some(Self {
            backend,
            key,
            token,
            ttl,
        }))
    }

    /// Rebuild a handle from a token handed over with a queued job
    pub fn resume(backend: Arc<dyn SharedBackend>, job_id: &str, token: String, ttl: Duration) -> Self {
        Self {
            backend,
            key: Self::key_for(job_id),
            token,
            ttl,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Extend the lease. A lapsed lease nobody took over is claimed again.
    /// `false` means another holder owns the lock.
    pub async fn refresh(&self) -> Result<bool> {
        if self
            .backend
            .compare_and_expire(&self.key, &self.token, self.ttl)
            .await?
        {
            return Ok(true);
        }
        let reclaimed = self.backend.set_nx(&self.key, &self.token, self.ttl).await?;
        if reclaimed {
            warn!(key = %self.key, "Lease had lapsed, lock reclaimed");
        }
        Ok(reclaimed)
    }

    /// Give the lock up if we still own it
    pub async fn release(&self) -> Result<()> {
        if !self.backend.compare_and_delete(&self.key, &self.token).await? {
            warn!(key = %self.key, "Lock was not held at release");
        }
        Ok(())
    }
}
