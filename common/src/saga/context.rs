// Per-task context handed to the saga handlers
//
// Built fresh by the runtime for every incoming task; only the circuit
// breaker and the client handles inside it are shared process-wide.

use crate::broker::{TaskInspector, TaskProducer};
use crate::circuit_breaker::CircuitBreaker;
use crate::errors::TaskError;
use crate::order_status::OrderStatusClient;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Outcome of the downstream watch for the current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// Downstream consumed the forward task (liveness, not success).
    #[default]
    Done,
    /// Downstream archived the forward task after exhausting retries.
    Failed,
    /// Forward task was never picked up within the watch timeout.
    Expired,
}

/// Everything a handler invocation needs, bundled explicitly.
pub struct TaskContext {
    pub producer: Arc<dyn TaskProducer>,
    pub inspector: Arc<dyn TaskInspector>,
    pub db: Option<PgPool>,

    pub server_queue: String,
    pub next_queue: Option<String>,
    pub previous_queue: Option<String>,

    pub breaker: Arc<CircuitBreaker>,
    pub order_status: OrderStatusClient,

    /// Span opened by the handler after the payload is parsed; closed on
    /// every exit path when the context is dropped.
    pub span: Span,
    pub task_state: TaskState,

    pub watch_timeout: Duration,
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Record a handler error on the current span.
    pub fn task_failed(&self, err: &TaskError) {
        self.span.record("otel.status_code", "ERROR");
        self.span
            .record("otel.status_message", tracing::field::display(err));
    }

    /// Mark the span successful.
    pub fn task_succeeded(&self) {
        self.span.record("otel.status_code", "OK");
    }

    /// Annotate the span with the downstream watch outcome.
    pub fn add_span_state_event(&self) {
        match self.task_state {
            TaskState::Expired => {
                let next_queue = self.next_queue.as_deref().unwrap_or_default();
                tracing::warn!(
                    parent: &self.span,
                    next_queue,
                    "timeout: downstream not picking up task"
                );
                self.span.record("otel.status_code", "ERROR");
                self.span.record("otel.status_message", "timeout");
            }
            TaskState::Failed => {
                tracing::warn!(parent: &self.span, "downstream task failed");
                self.span.record("otel.status_code", "ERROR");
                self.span.record("otel.status_message", "downstream failed");
            }
            TaskState::Done => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::circuit_breaker::CircuitBreaker;

    pub(crate) fn test_context(broker: Arc<MemoryBroker>) -> TaskContext {
        TaskContext {
            producer: broker.clone(),
            inspector: broker,
            db: None,
            server_queue: "payments".to_string(),
            next_queue: None,
            previous_queue: None,
            breaker: CircuitBreaker::with_defaults(),
            order_status: OrderStatusClient::new("127.0.0.1:1").unwrap(),
            span: Span::none(),
            task_state: TaskState::default(),
            watch_timeout: Duration::from_millis(20),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_task_state_defaults_to_done() {
        let ctx = test_context(Arc::new(MemoryBroker::new()));
        assert_eq!(ctx.task_state, TaskState::Done);
    }

    #[tokio::test]
    async fn test_span_annotations_do_not_panic_on_disabled_span() {
        let mut ctx = test_context(Arc::new(MemoryBroker::new()));
        ctx.task_failed(&TaskError::Cancelled);
        ctx.task_succeeded();
        ctx.task_state = TaskState::Expired;
        ctx.add_span_state_event();
        ctx.task_state = TaskState::Failed;
        ctx.add_span_state_event();
    }
}
