// Middleware wrapping every task handler invocation
//
// Declaration order: logging first, circuit-breaker post-hook second, so the
// breaker sees the handler's raw result and the log line sees the final one.

use crate::broker::TaskEnvelope;
use crate::errors::TaskError;
use crate::saga::context::TaskContext;
use crate::telemetry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// A task handler as seen by the worker runtime.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskEnvelope, ctx: &mut TaskContext) -> Result<(), TaskError>;
}

/// Logs entry/exit with duration and feeds the task metrics.
pub struct LoggingMiddleware {
    inner: Arc<dyn TaskHandler>,
}

impl LoggingMiddleware {
    pub fn new(inner: Arc<dyn TaskHandler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl TaskHandler for LoggingMiddleware {
    async fn handle(&self, task: &TaskEnvelope, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let start = Instant::now();
        info!(
            topic = %task.topic,
            task_id = %task.id,
            queue = %ctx.server_queue,
            "start processing task"
        );

        let result = self.inner.handle(task, ctx).await;

        let elapsed = start.elapsed();
        telemetry::record_task_duration(&ctx.server_queue, &task.topic, elapsed.as_secs_f64());
        match &result {
            Ok(()) => {
                telemetry::record_task_success(&ctx.server_queue, &task.topic);
                info!(
                    topic = %task.topic,
                    task_id = %task.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "finished processing task"
                );
            }
            Err(err) => {
                telemetry::record_task_failure(&ctx.server_queue, &task.topic);
                warn!(
                    topic = %task.topic,
                    task_id = %task.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "task processing failed"
                );
            }
        }

        result
    }
}

/// Feeds handler outcomes into the circuit breaker.
///
/// A success while the breaker is open is a short-circuited task and leaves
/// the state untouched; the breaker itself enforces that rule.
pub struct CircuitBreakerMiddleware {
    inner: Arc<dyn TaskHandler>,
}

impl CircuitBreakerMiddleware {
    pub fn new(inner: Arc<dyn TaskHandler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl TaskHandler for CircuitBreakerMiddleware {
    async fn handle(&self, task: &TaskEnvelope, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let result = self.inner.handle(task, ctx).await;
        match &result {
            Ok(()) => ctx.breaker.on_task_success(),
            Err(_) => ctx.breaker.on_task_failure(),
        }
        result
    }
}

/// Wrap a handler in the standard chain.
pub fn apply_middleware(handler: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> {
    Arc::new(LoggingMiddleware::new(Arc::new(
        CircuitBreakerMiddleware::new(handler),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
    use crate::errors::StepError;
    use crate::order_status::OrderStatusClient;
    use crate::saga::context::TaskState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tracing::Span;

    struct ToggleHandler {
        fail: AtomicBool,
    }

    #[async_trait]
    impl TaskHandler for ToggleHandler {
        async fn handle(
            &self,
            _task: &TaskEnvelope,
            _ctx: &mut TaskContext,
        ) -> Result<(), TaskError> {
            if self.fail.load(Ordering::Relaxed) {
                Err(TaskError::Step(StepError::Other("boom".to_string())))
            } else {
                Ok(())
            }
        }
    }

    fn test_ctx(breaker: Arc<CircuitBreaker>) -> TaskContext {
        let broker = Arc::new(MemoryBroker::new());
        TaskContext {
            producer: broker.clone(),
            inspector: broker,
            db: None,
            server_queue: "payments".to_string(),
            next_queue: None,
            previous_queue: None,
            breaker,
            order_status: OrderStatusClient::new("127.0.0.1:1").unwrap(),
            span: Span::none(),
            task_state: TaskState::default(),
            watch_timeout: Duration::from_millis(20),
            cancel: CancellationToken::new(),
        }
    }

    fn envelope() -> TaskEnvelope {
        TaskEnvelope {
            id: "t1".to_string(),
            topic: "task:perform".to_string(),
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_chain_opens_breaker_after_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            max_consecutive_fails: 5,
            open_interval: Duration::from_secs(60),
        });
        let chain = apply_middleware(Arc::new(ToggleHandler {
            fail: AtomicBool::new(true),
        }));
        let mut ctx = test_ctx(breaker.clone());

        for i in 1..=5u32 {
            let result = chain.handle(&envelope(), &mut ctx).await;
            assert!(result.is_err());
            if i < 5 {
                assert_eq!(breaker.state(), BreakerState::Closed);
                assert_eq!(breaker.fails(), i);
            }
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_breaker_to_closed() {
        let breaker = CircuitBreaker::with_defaults();
        breaker.on_task_failure();
        breaker.on_task_failure();
        assert_eq!(breaker.fails(), 2);

        let chain = apply_middleware(Arc::new(ToggleHandler {
            fail: AtomicBool::new(false),
        }));
        let mut ctx = test_ctx(breaker.clone());
        chain.handle(&envelope(), &mut ctx).await.unwrap();

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.fails(), 0);
    }

    #[tokio::test]
    async fn test_result_passes_through_unchanged() {
        let breaker = CircuitBreaker::with_defaults();
        let handler = Arc::new(ToggleHandler {
            fail: AtomicBool::new(true),
        });
        let chain = apply_middleware(handler.clone());
        let mut ctx = test_ctx(breaker);

        let result = chain.handle(&envelope(), &mut ctx).await;
        assert!(matches!(result, Err(TaskError::Step(_))));

        handler.fail.store(false, Ordering::Relaxed);
        assert!(chain.handle(&envelope(), &mut ctx).await.is_ok());
    }
}
