//! Task queue (Redis list)
//!
//! Producers `RPUSH` JSON [`ScanTask`] payloads; the worker pops them with a
//! bounded `BLPOP` so shutdown requests are noticed while the queue is idle.

use async_trait::async_trait;
use neurodx_common::config::RedisConfig;
use neurodx_common::ScanTask;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker unreachable or command failed
    #[error("Queue connection error: {0}")]
    Connection(String),

    /// Payload popped but not a valid task message
    #[error("Malformed queue message {payload:?}: {reason}")]
    Malformed { payload: String, reason: String },
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Connection(err.to_string())
    }
}

/// Source of scan tasks
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Wait up to the queue's poll timeout for the next task
    ///
    /// `Ok(None)` means the timeout elapsed with the queue empty.
    async fn next_task(&self) -> Result<Option<ScanTask>, QueueError>;
}

pub struct RedisTaskQueue {
    connection: MultiplexedConnection,
    queue: String,
    poll_timeout: Duration,
}

impl RedisTaskQueue {
    pub async fn connect(config: &RedisConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url())?;
        let connection = client.get_multiplexed_async_connection().await?;

        tracing::info!(
            host = %config.host,
            port = config.port,
            queue = %config.queue,
            "Connected to task queue"
        );

        Ok(Self {
            connection,
            queue: config.queue.clone(),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }
}

/// Decode one popped payload
pub fn parse_payload(payload: &str) -> Result<ScanTask, QueueError> {
    ScanTask::from_json(payload).map_err(|e| QueueError::Malformed {
        payload: payload.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn next_task(&self) -> Result<Option<ScanTask>, QueueError> {
        let mut connection = self.connection.clone();
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.queue)
            .arg(self.poll_timeout.as_secs_f64())
            .query_async(&mut connection)
            .await?;

        match popped {
            Some((_, payload)) => {
                tracing::debug!(queue = %self.queue, bytes = payload.len(), "Popped task payload");
                parse_payload(&payload).map(Some)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_with_extra_fields_is_accepted() {
        let task = parse_payload(
            r#"{"scan_id": 12, "object_name": "scans/12/brain.nii.gz", "created_at": 1700000000, "priority": 3}"#,
        )
        .unwrap();
        assert_eq!(task.scan_id, 12);
        assert_eq!(task.object_name, "scans/12/brain.nii.gz");
    }

    #[test]
    fn test_malformed_payload_keeps_raw_text() {
        let err = parse_payload("{\"object_name\": 5}").unwrap_err();
        match err {
            QueueError::Malformed { payload, .. } => assert_eq!(payload, "{\"object_name\": 5}"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
