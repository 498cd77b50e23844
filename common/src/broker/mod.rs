// Message-queue broker abstraction
//
// The saga engine only ever talks to these traits; the Redis implementation
// is the deployment default and the in-memory one backs tests and demos.

use crate::errors::BrokerError;
use async_trait::async_trait;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Topic of forward saga traffic.
pub const TOPIC_PERFORM: &str = "task:perform";
/// Topic of compensating saga traffic.
pub const TOPIC_REVERT: &str = "task:revert";

/// Lifecycle states a queued task can be observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerTaskState {
    Pending,
    Active,
    Scheduled,
    Retry,
    Archived,
    Completed,
}

impl BrokerTaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerTaskState::Pending => "pending",
            BrokerTaskState::Active => "active",
            BrokerTaskState::Scheduled => "scheduled",
            BrokerTaskState::Retry => "retry",
            BrokerTaskState::Archived => "archived",
            BrokerTaskState::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(BrokerTaskState::Pending),
            "active" => Some(BrokerTaskState::Active),
            "scheduled" => Some(BrokerTaskState::Scheduled),
            "retry" => Some(BrokerTaskState::Retry),
            "archived" => Some(BrokerTaskState::Archived),
            "completed" => Some(BrokerTaskState::Completed),
            _ => None,
        }
    }
}

/// Inspector view of a queued task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub state: BrokerTaskState,
    pub last_err: Option<String>,
}

/// A task pulled from a queue.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Producer half: enqueue a task onto a named queue.
#[async_trait]
pub trait TaskProducer: Send + Sync {
    /// Enqueue `payload` under `topic` and return the broker task id.
    async fn enqueue(
        &self,
        topic: &str,
        payload: &[u8],
        queue: &str,
        max_retry: u32,
    ) -> Result<String, BrokerError>;
}

/// Inspector half: query and delete tasks by id.
#[async_trait]
pub trait TaskInspector: Send + Sync {
    /// Look up a task; `BrokerError::TaskNotFound` when no record exists.
    async fn task_info(&self, queue: &str, task_id: &str) -> Result<TaskInfo, BrokerError>;

    /// Remove a task record and drop it from the pending queue.
    async fn delete_task(&self, queue: &str, task_id: &str) -> Result<(), BrokerError>;
}

/// Consumer half: pull tasks and report their outcome.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Wait briefly for the next task on `queue`. `None` means the wait
    /// timed out and the caller should poll again.
    async fn fetch(&self, queue: &str) -> Result<Option<TaskEnvelope>, BrokerError>;

    /// Mark a task consumed. The record is dropped, so a later inspection
    /// reports `TaskNotFound`.
    async fn complete(&self, queue: &str, task_id: &str) -> Result<(), BrokerError>;

    /// Record a failed attempt. Retriable tasks with budget left go back to
    /// the queue; everything else is archived with `err` as its last error.
    async fn fail(
        &self,
        queue: &str,
        task_id: &str,
        err: &str,
        retriable: bool,
    ) -> Result<(), BrokerError>;
}
