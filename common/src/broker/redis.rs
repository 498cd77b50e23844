// Redis-backed job queue
//
// Data layout:
// - `saga:queue:{name}` (LIST): FIFO of pending task ids (RPUSH / BLPOP)
// - `saga:task:{queue}:{id}` (HASH): topic, payload, state, max_retry,
//   retried, last_err, enqueued_at
//
// A consumed task's record is deleted outright, so the inspector observing
// `TaskNotFound` means "picked up by a downstream worker". Archived records
// expire after a day.

use crate::broker::{
    BrokerTaskState, TaskEnvelope, TaskInfo, TaskInspector, TaskProducer, TaskSource,
};
use crate::errors::BrokerError;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Seconds an archived task record is kept for inspection.
const ARCHIVED_TTL_SECS: i64 = 24 * 3600;

/// How long a fetch blocks waiting for work before yielding to the caller.
const FETCH_BLOCK_SECS: f64 = 1.0;

/// Redis job-queue client. Cheap to clone; all handles share one multiplexed
/// connection manager.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to Redis at `addr` (`host:port` or a full `redis://` URL).
    #[instrument(skip(addr))]
    pub async fn connect(addr: &str) -> Result<Self, BrokerError> {
        let url = if addr.starts_with("redis://") {
            addr.to_string()
        } else {
            format!("redis://{}", addr)
        };

        let client = redis::Client::open(url.as_str())
            .map_err(|e| BrokerError::Connection(format!("invalid redis address: {}", e)))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!("connected to redis broker");
        Ok(Self { conn })
    }

    /// Verify the connection is alive.
    pub async fn health_check(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(format!("health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(BrokerError::Connection(format!(
                "unexpected PING response: {}",
                response
            )));
        }
        Ok(())
    }

    fn queue_key(queue: &str) -> String {
        format!("saga:queue:{}", queue)
    }

    fn task_key(queue: &str, task_id: &str) -> String {
        format!("saga:task:{}:{}", queue, task_id)
    }
}

#[async_trait]
impl TaskProducer for RedisBroker {
    #[instrument(skip(self, payload), fields(queue = %queue, topic = %topic))]
    async fn enqueue(
        &self,
        topic: &str,
        payload: &[u8],
        queue: &str,
        max_retry: u32,
    ) -> Result<String, BrokerError> {
        let task_id = Uuid::new_v4().to_string();
        let task_key = Self::task_key(queue, &task_id);
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset(&task_key, "topic", topic)
            .ignore()
            .hset(&task_key, "payload", payload)
            .ignore()
            .hset(&task_key, "state", BrokerTaskState::Pending.as_str())
            .ignore()
            .hset(&task_key, "max_retry", max_retry)
            .ignore()
            .hset(&task_key, "retried", 0)
            .ignore()
            .hset(&task_key, "enqueued_at", Utc::now().to_rfc3339())
            .ignore()
            .rpush(Self::queue_key(queue), &task_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::EnqueueFailed(e.to_string()))?;

        debug!(task_id = %task_id, "task enqueued");
        Ok(task_id)
    }
}

#[async_trait]
impl TaskInspector for RedisBroker {
    async fn task_info(&self, queue: &str, task_id: &str) -> Result<TaskInfo, BrokerError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, Vec<u8>> = conn
            .hgetall(Self::task_key(queue, task_id))
            .await
            .map_err(|e| BrokerError::InspectionFailed(e.to_string()))?;

        if fields.is_empty() {
            return Err(BrokerError::TaskNotFound);
        }

        let state = fields
            .get("state")
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .and_then(|s| BrokerTaskState::parse(&s))
            .unwrap_or(BrokerTaskState::Pending);

        let last_err = fields
            .get("last_err")
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .filter(|s| !s.is_empty());

        Ok(TaskInfo { state, last_err })
    }

    #[instrument(skip(self), fields(queue = %queue, task_id = %task_id))]
    async fn delete_task(&self, queue: &str, task_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(Self::queue_key(queue), 0, task_id)
            .ignore()
            .del(Self::task_key(queue, task_id))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::DeleteFailed(e.to_string()))?;

        debug!("task deleted");
        Ok(())
    }
}

#[async_trait]
impl TaskSource for RedisBroker {
    async fn fetch(&self, queue: &str) -> Result<Option<TaskEnvelope>, BrokerError> {
        let mut conn = self.conn.clone();

        let popped: Option<(String, String)> = conn
            .blpop(Self::queue_key(queue), FETCH_BLOCK_SECS)
            .await
            .map_err(|e| BrokerError::FetchFailed(e.to_string()))?;

        let Some((_, task_id)) = popped else {
            return Ok(None);
        };

        let task_key = Self::task_key(queue, &task_id);
        let _: () = conn
            .hset(&task_key, "state", BrokerTaskState::Active.as_str())
            .await
            .map_err(|e| BrokerError::StateUpdateFailed(e.to_string()))?;

        let fields: HashMap<String, Vec<u8>> = conn
            .hgetall(&task_key)
            .await
            .map_err(|e| BrokerError::FetchFailed(e.to_string()))?;

        if fields.is_empty() {
            // record deleted between pop and read; treat as spurious wakeup
            return Ok(None);
        }

        let topic = fields
            .get("topic")
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        let payload = fields.get("payload").cloned().unwrap_or_default();

        Ok(Some(TaskEnvelope {
            id: task_id,
            topic,
            payload,
        }))
    }

    async fn complete(&self, queue: &str, task_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(Self::task_key(queue, task_id))
            .await
            .map_err(|e| BrokerError::StateUpdateFailed(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, err), fields(queue = %queue, task_id = %task_id))]
    async fn fail(
        &self,
        queue: &str,
        task_id: &str,
        err: &str,
        retriable: bool,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let task_key = Self::task_key(queue, task_id);

        let max_retry: Option<u32> = conn
            .hget(&task_key, "max_retry")
            .await
            .map_err(|e| BrokerError::StateUpdateFailed(e.to_string()))?;
        let Some(max_retry) = max_retry else {
            return Err(BrokerError::TaskNotFound);
        };

        let retried: u32 = conn
            .hincr(&task_key, "retried", 1)
            .await
            .map_err(|e| BrokerError::StateUpdateFailed(e.to_string()))?;

        if retriable && retried <= max_retry {
            debug!(retried, max_retry, "re-queueing failed task");
            let _: () = redis::pipe()
                .atomic()
                .hset(&task_key, "state", BrokerTaskState::Retry.as_str())
                .ignore()
                .hset(&task_key, "last_err", err)
                .ignore()
                .rpush(Self::queue_key(queue), task_id)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| BrokerError::StateUpdateFailed(e.to_string()))?;
        } else {
            debug!("archiving failed task");
            let _: () = redis::pipe()
                .atomic()
                .hset(&task_key, "state", BrokerTaskState::Archived.as_str())
                .ignore()
                .hset(&task_key, "last_err", err)
                .ignore()
                .expire(&task_key, ARCHIVED_TTL_SECS)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| BrokerError::StateUpdateFailed(e.to_string()))?;
        }

        Ok(())
    }
}
