use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::crawler::error::CrawlError;

/// Bounds in-flight fetches for one job and paces their dispatch.
///
/// At most `max_in_flight` fetches hold a permit at once. Independently of
/// permits, two dispatches never start closer together than `min_interval`.
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    min_interval: Duration,
    acquire_timeout: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

/// Right to run one fetch; released on drop
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    pub fn release(self) {}
}

impl ConcurrencyGate {
    pub fn new(max_in_flight: usize, min_interval: Duration, acquire_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
            min_interval,
            acquire_timeout,
            last_dispatch: Mutex::new(None),
        }
    }

    /// Fetches currently allowed to start
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for the pacing slot, then for a permit.
    ///
    /// Callers queue for their dispatch slot without holding a permit, so the
    /// pacing wait never counts against the acquire timeout. Fails with
    /// `ResourceExhausted` when no permit frees up within the acquire timeout
    /// once the slot is reached.
    pub async fn acquire(&self) -> Result<GatePermit, CrawlError> {
        // held across both waits so dispatches start one after another
        let mut last = self.last_dispatch.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "Pacing dispatch");
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let timeout_ms = self.acquire_timeout.as_millis() as u64;
        let permit = match tokio::time::timeout(
            self.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(CrawlError::ResourceExhausted(timeout_ms)),
        };
        *last = Some(Instant::now());

        Ok(GatePermit { _permit: permit })
    }
}
