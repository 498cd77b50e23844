// Error handling framework shared across the saga engine

use crate::order_status::OrderStatus;
use thiserror::Error;

/// Broker-level errors
///
/// `TaskNotFound` is a sentinel: the downstream watch relies on it to tell
/// "task already consumed" apart from genuine inspection failures.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("task not found")]
    TaskNotFound,

    #[error("failed to connect to broker: {0}")]
    Connection(String),

    #[error("failed to enqueue task: {0}")]
    EnqueueFailed(String),

    #[error("failed to fetch task: {0}")]
    FetchFailed(String),

    #[error("task inspection failed: {0}")]
    InspectionFailed(String),

    #[error("failed to delete task: {0}")]
    DeleteFailed(String),

    #[error("failed to update task state: {0}")]
    StateUpdateFailed(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::TaskNotFound)
    }
}

/// Errors returned by a concrete step's `perform`/`revert` hooks
#[derive(Error, Debug)]
pub enum StepError {
    /// The saga must fail for a business reason; the coordinator reports
    /// `status` to the order service before compensating.
    #[error("step failed: {reason}")]
    Business {
        status: OrderStatus,
        reason: String,
    },

    #[error("database query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("step failed: {0}")]
    Other(String),
}

/// Task-handler errors as surfaced to the broker runtime
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("malformed task payload: {0}")]
    PayloadMalformed(#[from] serde_json::Error),

    #[error("circuit breaker open on {queue}")]
    BreakerOpen { queue: String },

    #[error("forced failure triggered on {queue}")]
    ForcedFail { queue: String },

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("downstream task not consumed on {queue}")]
    DownstreamExpired { queue: String },

    #[error("downstream task failed on {queue}: {last_err}")]
    DownstreamFailed { queue: String, last_err: String },

    #[error("task cancelled")]
    Cancelled,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("transaction failed: {0}")]
    Transaction(sqlx::Error),
}

impl TaskError {
    /// Whether the broker may re-deliver the task. Malformed payloads never
    /// are: re-running the same bytes cannot succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, TaskError::PayloadMalformed(_))
    }
}

/// Order-service client errors (best-effort reporting; logged, not fatal)
#[derive(Error, Debug)]
pub enum OrderStatusError {
    #[error("failed to build order-service client: {0}")]
    ClientBuild(String),

    #[error("order-service request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("order service responded with status {0}")]
    UnexpectedStatus(reqwest::StatusCode),
}

/// Database connectivity errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("database health check failed: {0}")]
    HealthCheckFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_malformed_is_not_retriable() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = TaskError::from(err);
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_other_task_errors_are_retriable() {
        let err = TaskError::BreakerOpen {
            queue: "payments".to_string(),
        };
        assert!(err.is_retriable());

        let err = TaskError::DownstreamExpired {
            queue: "shipping".to_string(),
        };
        assert!(err.is_retriable());
    }

    #[test]
    fn test_broker_not_found_sentinel() {
        assert!(BrokerError::TaskNotFound.is_not_found());
        assert!(!BrokerError::Connection("refused".to_string()).is_not_found());
    }

    #[test]
    fn test_task_error_display_includes_queue() {
        let err = TaskError::DownstreamFailed {
            queue: "inventory".to_string(),
            last_err: "out of stock".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("inventory"));
        assert!(msg.contains("out of stock"));
    }
}
