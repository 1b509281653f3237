use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::{aio::MultiplexedConnection, Client, Script};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::storage::backend::SharedBackend;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed shared store: cache entries, locks, the job queue and
/// progress pub/sub
pub struct RedisBackend {
    /// Redis client
    client: Client,

    /// Shared multiplexed connection
    conn_pool: Arc<Mutex<MultiplexedConnection>>,

    compare_and_delete: Script,
    compare_and_expire: Script,
}

impl RedisBackend {
    /// Connect to Redis
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .context(format!("Failed to connect to Redis at {}", redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        debug!("Connected to Redis at {}", redis_url);

        Ok(Self {
            client,
            conn_pool: Arc::new(Mutex::new(conn)),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl SharedBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_pool.lock().await;

        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .context(format!("Failed to read key {}", key))?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }

        cmd.query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("Failed to write key {}", key))?;

        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_pool.lock().await;

        // SET NX replies OK when written and nil otherwise
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await
            .context(format!("Failed to SET NX key {}", key))?;

        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;

        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("Failed to delete key {}", key))?;

        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn_pool.lock().await;

        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut *conn)
            .await
            .context(format!("Failed to release key {}", key))?;

        Ok(deleted == 1)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_pool.lock().await;

        let refreshed: i64 = self
            .compare_and_expire
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut *conn)
            .await
            .context(format!("Failed to refresh key {}", key))?;

        Ok(refreshed == 1)
    }

    async fn push(&self, queue: &str, value: &str) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;

        redis::cmd("LPUSH")
            .arg(queue)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push job to Redis queue")?;

        debug!("Pushed {} to queue {}", value, queue);

        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        // BRPOP blocks its connection, so it gets one of its own
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .context("Failed to open Redis connection for BRPOP")?;

        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(queue)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .context("Failed to pop job from Redis queue")?;

        Ok(reply.map(|(_, value)| value))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;

        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("Failed to publish on {}", channel))?;

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .context("Failed to open Redis connection for SUBSCRIBE")?;

        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .context(format!("Failed to subscribe to {}", channel))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!("Dropping undecodable pub/sub payload: {}", e);
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}
