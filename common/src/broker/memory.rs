// In-process job queue
//
// Mirrors the Redis broker's observable behavior (FIFO queues, task records
// deleted on completion, archive-on-failure) without any I/O. Backs the unit
// and integration tests and single-process demos.

use crate::broker::{
    BrokerTaskState, TaskEnvelope, TaskInfo, TaskInspector, TaskProducer, TaskSource,
};
use crate::errors::BrokerError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

const FETCH_BLOCK: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct StoredTask {
    topic: String,
    payload: Vec<u8>,
    state: BrokerTaskState,
    max_retry: u32,
    retried: u32,
    last_err: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, VecDeque<String>>,
    tasks: HashMap<(String, String), StoredTask>,
}

/// In-memory broker shared between producers and consumers via `Arc`.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting on `queue`. Test helper.
    pub fn pending_len(&self, queue: &str) -> usize {
        let inner = self.inner.lock().expect("broker mutex poisoned");
        inner.queues.get(queue).map_or(0, |q| q.len())
    }

    fn key(queue: &str, task_id: &str) -> (String, String) {
        (queue.to_string(), task_id.to_string())
    }
}

#[async_trait]
impl TaskProducer for MemoryBroker {
    async fn enqueue(
        &self,
        topic: &str,
        payload: &[u8],
        queue: &str,
        max_retry: u32,
    ) -> Result<String, BrokerError> {
        let task_id = Uuid::new_v4().to_string();
        {
            let mut inner = self.inner.lock().expect("broker mutex poisoned");
            inner.tasks.insert(
                Self::key(queue, &task_id),
                StoredTask {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    state: BrokerTaskState::Pending,
                    max_retry,
                    retried: 0,
                    last_err: None,
                },
            );
            inner
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(task_id.clone());
        }
        self.notify.notify_waiters();
        Ok(task_id)
    }
}

#[async_trait]
impl TaskInspector for MemoryBroker {
    async fn task_info(&self, queue: &str, task_id: &str) -> Result<TaskInfo, BrokerError> {
        let inner = self.inner.lock().expect("broker mutex poisoned");
        let task = inner
            .tasks
            .get(&Self::key(queue, task_id))
            .ok_or(BrokerError::TaskNotFound)?;
        Ok(TaskInfo {
            state: task.state,
            last_err: task.last_err.clone(),
        })
    }

    async fn delete_task(&self, queue: &str, task_id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.tasks.remove(&Self::key(queue, task_id));
        if let Some(pending) = inner.queues.get_mut(queue) {
            pending.retain(|id| id != task_id);
        }
        Ok(())
    }
}

#[async_trait]
impl TaskSource for MemoryBroker {
    async fn fetch(&self, queue: &str) -> Result<Option<TaskEnvelope>, BrokerError> {
        {
            let mut inner = self.inner.lock().expect("broker mutex poisoned");
            while let Some(task_id) = inner
                .queues
                .get_mut(queue)
                .and_then(|pending| pending.pop_front())
            {
                let key = Self::key(queue, &task_id);
                // a deleted record can leave a dangling queue entry
                if let Some(task) = inner.tasks.get_mut(&key) {
                    task.state = BrokerTaskState::Active;
                    return Ok(Some(TaskEnvelope {
                        id: task_id,
                        topic: task.topic.clone(),
                        payload: task.payload.clone(),
                    }));
                }
            }
        }

        let _ = tokio::time::timeout(FETCH_BLOCK, self.notify.notified()).await;
        Ok(None)
    }

    async fn complete(&self, queue: &str, task_id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.tasks.remove(&Self::key(queue, task_id));
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        task_id: &str,
        err: &str,
        retriable: bool,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        let key = Self::key(queue, task_id);
        let task = inner.tasks.get_mut(&key).ok_or(BrokerError::TaskNotFound)?;

        task.retried += 1;
        task.last_err = Some(err.to_string());

        if retriable && task.retried <= task.max_retry {
            task.state = BrokerTaskState::Retry;
            inner
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(task_id.to_string());
            drop(inner);
            self.notify.notify_waiters();
        } else {
            task.state = BrokerTaskState::Archived;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_is_fifo() {
        let broker = MemoryBroker::new();
        let first = broker.enqueue("task:perform", b"a", "q", 0).await.unwrap();
        let second = broker.enqueue("task:perform", b"b", "q", 0).await.unwrap();

        assert_eq!(broker.fetch("q").await.unwrap().unwrap().id, first);
        assert_eq!(broker.fetch("q").await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none_after_block() {
        let broker = MemoryBroker::new();
        assert!(broker.fetch("empty").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completed_task_reports_not_found() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue("task:perform", b"{}", "q", 0).await.unwrap();
        let _ = broker.fetch("q").await.unwrap().unwrap();
        broker.complete("q", &id).await.unwrap();

        assert!(matches!(
            broker.task_info("q", &id).await,
            Err(BrokerError::TaskNotFound)
        ));
    }

    #[tokio::test]
    async fn test_failed_task_with_no_budget_is_archived() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue("task:perform", b"{}", "q", 0).await.unwrap();
        let _ = broker.fetch("q").await.unwrap().unwrap();
        broker.fail("q", &id, "boom", true).await.unwrap();

        let info = broker.task_info("q", &id).await.unwrap();
        assert_eq!(info.state, BrokerTaskState::Archived);
        assert_eq!(info.last_err.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_failed_task_with_budget_is_requeued() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue("task:perform", b"{}", "q", 2).await.unwrap();
        let _ = broker.fetch("q").await.unwrap().unwrap();
        broker.fail("q", &id, "boom", true).await.unwrap();

        let info = broker.task_info("q", &id).await.unwrap();
        assert_eq!(info.state, BrokerTaskState::Retry);
        assert_eq!(broker.pending_len("q"), 1);
    }

    #[tokio::test]
    async fn test_non_retriable_failure_skips_budget() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue("task:perform", b"{}", "q", 5).await.unwrap();
        let _ = broker.fetch("q").await.unwrap().unwrap();
        broker.fail("q", &id, "bad payload", false).await.unwrap();

        let info = broker.task_info("q", &id).await.unwrap();
        assert_eq!(info.state, BrokerTaskState::Archived);
    }

    #[tokio::test]
    async fn test_delete_drops_pending_entry() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue("task:perform", b"{}", "q", 0).await.unwrap();
        broker.delete_task("q", &id).await.unwrap();

        assert_eq!(broker.pending_len("q"), 0);
        assert!(broker.fetch("q").await.unwrap().is_none());
    }
}
