//! Redis list holding translation jobs.
//!
//! Producers `LPUSH` JSON job records onto the list and the worker takes them
//! from the other end with `BRPOP`, so jobs are handled in FIFO order. A job
//! is removed from Redis as soon as it is popped; there is no processing list
//! and no dead-letter list.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::error::QueueError;
use crate::job::JobMessage;

/// Where the worker gets raw job payloads from.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Waits up to `timeout` for the next payload. `None` means the wait
    /// timed out with the queue empty.
    async fn pop(&self, timeout: Duration) -> Result<Option<String>, QueueError>;
}

/// Redis-backed job queue.
pub struct RedisQueue {
    redis: ConnectionManager,
    queue_name: String,
}

impl RedisQueue {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Wraps an existing connection.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Checks that the server answers.
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Adds a job to the queue.
    pub async fn push(&self, job: &JobMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.queue_name)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Number of jobs waiting.
    pub async fn pending(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let len: u64 = redis::cmd("LLEN")
            .arg(&self.queue_name)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

#[async_trait]
impl JobSource for RedisQueue {
    async fn pop(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        // BRPOP takes whole seconds; 0 would block forever
        let timeout_secs = timeout.as_secs().max(1);

        let result: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.queue_name)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|(_, payload)| payload))
    }
}
