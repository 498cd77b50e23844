// Downstream watch: post-enqueue liveness probe of the next queue
//
// Deliberately primitive: sleep, then inspect the forwarded task once. The
// outcome is a liveness signal only; success of the downstream subchain is
// reported asynchronously through revert traffic (or its absence), with the
// circuit breaker as the feedback channel.

use crate::broker::{BrokerTaskState, TaskInspector};
use crate::circuit_breaker::CircuitBreaker;
use crate::errors::BrokerError;
use crate::saga::context::TaskState;
use std::time::Duration;
use tracing::{debug, warn};

/// Sleep `timeout`, then classify the forwarded task's fate.
///
/// Breaker fails are counted here for every unhealthy outcome; stale task
/// records are deleted so the queue does not accumulate dead entries.
pub async fn downstream_state(
    inspector: &dyn TaskInspector,
    breaker: &CircuitBreaker,
    next_queue: &str,
    task_id: &str,
    timeout: Duration,
) -> (TaskState, Option<String>) {
    tokio::time::sleep(timeout).await;

    match inspector.task_info(next_queue, task_id).await {
        Err(BrokerError::TaskNotFound) => {
            debug!(next_queue, task_id, "forward task already consumed");
            (TaskState::Done, None)
        }
        Err(err) => {
            warn!(next_queue, task_id, error = %err, "inspector query failed");
            breaker.increment_fails();
            (TaskState::Failed, Some(err.to_string()))
        }
        Ok(info) => match info.state {
            BrokerTaskState::Active => {
                debug!(next_queue, task_id, "forward task is being processed");
                (TaskState::Done, None)
            }
            BrokerTaskState::Archived => {
                warn!(next_queue, task_id, "forward task failed downstream");
                breaker.increment_fails();
                delete_stale(inspector, next_queue, task_id).await;
                (TaskState::Failed, info.last_err)
            }
            state => {
                warn!(
                    next_queue,
                    task_id,
                    state = state.as_str(),
                    "forward task not picked up in time"
                );
                breaker.increment_fails();
                delete_stale(inspector, next_queue, task_id).await;
                (TaskState::Expired, None)
            }
        },
    }
}

async fn delete_stale(inspector: &dyn TaskInspector, queue: &str, task_id: &str) {
    if let Err(err) = inspector.delete_task(queue, task_id).await {
        warn!(queue, task_id, error = %err, "failed to delete stale task");
    }
}
