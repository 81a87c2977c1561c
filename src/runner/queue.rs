//! Redis-backed task queue with reliable dequeue.
//!
//! The queue is the at-least-once transport between the dispatcher and
//! the workers. It uses two Redis lists:
//!
//! - `{queue_name}`: main list where tasks are enqueued
//! - `{queue_name}:processing`: deliveries being processed
//!
//! Dequeue atomically moves the delivery into the processing list with
//! BRPOPLPUSH; workers acknowledge when done. Deliveries stranded in the
//! processing list after a crash are moved back on startup, which is where
//! redelivery comes from; handlers stay safe to re-run because every
//! write downstream is an upsert.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use uuid::Uuid;

use super::task::Envelope;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or parse a task.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The queue is shut down (in-memory implementations only).
    #[error("Queue is closed")]
    Closed,
}

/// At-least-once task transport between dispatcher and workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues one delivery.
    async fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError>;

    /// Enqueues many deliveries at once.
    async fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> Result<(), QueueError>;

    /// Blocks up to `timeout` for the next delivery.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Envelope>, QueueError>;

    /// Acknowledges a delivery, removing it from the processing list.
    async fn ack(&self, envelope_id: Uuid) -> Result<(), QueueError>;

    /// Returns stranded in-flight deliveries to the main list.
    ///
    /// Called once at pool startup; returns the number recovered.
    async fn recover(&self) -> Result<usize, QueueError>;

    /// Number of deliveries waiting in the main list.
    async fn len(&self) -> Result<usize, QueueError>;
}

/// Redis implementation of [`TaskQueue`].
pub struct RedisTaskQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Name of the main list.
    queue_name: String,
    /// Name of the processing list.
    processing_queue: String,
}

impl RedisTaskQueue {
    /// Connects to Redis and creates a new queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a queue from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: format!("{}:processing", queue_name),
        }
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Number of deliveries currently in the processing list.
    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.processing_queue).await?;
        Ok(len)
    }

    /// Clears both lists.
    ///
    /// **Warning**: permanently deletes all queued tasks.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.del(&self.queue_name).del(&self.processing_queue);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(())
    }

    async fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> Result<(), QueueError> {
        if envelopes.is_empty() {
            return Ok(());
        }

        let serialized: Result<Vec<String>, _> =
            envelopes.iter().map(serde_json::to_string).collect();
        let serialized = serialized?;

        let mut conn = self.redis.clone();

        // Pipeline for batch efficiency
        let mut pipe = redis::pipe();
        for data in &serialized {
            pipe.lpush(&self.queue_name, data);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Envelope>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        // BRPOPLPUSH atomically pops from the main list and pushes to the
        // processing list, so a crash between dequeue and ack loses nothing.
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => {
                let envelope: Envelope = serde_json::from_str(&data)?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, envelope_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;
        for data in entries {
            if let Ok(envelope) = serde_json::from_str::<Envelope>(&data) {
                if envelope.id == envelope_id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &data)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Not found is not an error - the delivery may have been recovered
        // by another process already.
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;
        for data in entries {
            // Atomically move the delivery back to the main list.
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&self.processing_queue, 1, &data)
                .rpush(&self.queue_name, &data);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue_name).await?;
        Ok(len)
    }
}
