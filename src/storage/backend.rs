use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Capabilities the engine needs from the shared cache/queue store.
///
/// Every worker process talks to the same backend; it is the only state
/// shared between concurrent jobs.
#[async_trait]
pub trait SharedBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, expiring after `ttl` when given
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Store only if the key is absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete the key only while it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the key's TTL only while it still holds `expected`
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Append to a FIFO queue
    async fn push(&self, queue: &str, value: &str) -> Result<()>;

    /// Take the oldest queue entry, waiting up to `timeout`
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>>;

    /// Fire-and-forget broadcast to current subscribers
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}

const CHANNEL_CAPACITY: usize = 256;
const POP_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process backend for tests and single-process runs
#[derive(Clone, Default)]
pub struct MemoryBackend {
    values: Arc<Mutex<HashMap<String, StoredValue>>>,
    queues: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys starting with `prefix`
    pub fn count_prefix(&self, prefix: &str) -> usize {
        let now = Instant::now();
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values
            .iter()
            .filter(|(key, stored)| key.starts_with(prefix) && stored.is_live(now))
            .count()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Run `f` on the value map with `key` already expired if its TTL passed
    fn with_values<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, StoredValue>, Instant) -> T) -> T {
        let now = Instant::now();
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if values.get(key).is_some_and(|stored| !stored.is_live(now)) {
            values.remove(key);
        }
        f(&mut values, now)
    }
}

#[async_trait]
impl SharedBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_values(key, |values, _| values.get(key).map(|stored| stored.value.clone())))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_values(key, |values, now| {
            values.insert(
                key.to_string(),
                StoredValue {
                    value: value.to_string(),
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            );
        });
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        Ok(self.with_values(key, |values, now| {
            if values.contains_key(key) {
                return false;
            }
            values.insert(
                key.to_string(),
                StoredValue {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
            true
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_values(key, |values, _| {
            values.remove(key);
        });
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        Ok(self.with_values(key, |values, _| match values.get(key) {
            Some(stored) if stored.value == expected => {
                values.remove(key);
                true
            }
            _ => false,
        }))
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        Ok(self.with_values(key, |values, now| match values.get_mut(key) {
            Some(stored) if stored.value == expected => {
                stored.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        }))
    }

    async fn push(&self, queue: &str, value: &str) -> Result<()> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(value) = queues.get_mut(queue).and_then(|q| q.pop_front()) {
                    return Ok(Some(value));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // no receivers is not an error for pub/sub
        let _ = self.sender(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let receiver = self.sender(channel).subscribe();
        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    // slow subscribers skip ahead
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
