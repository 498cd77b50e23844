// Worker runtime glue: handler registry and the consumer loop

use crate::broker::{
    TaskEnvelope, TaskInspector, TaskProducer, TaskSource, TOPIC_PERFORM, TOPIC_REVERT,
};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Settings;
use crate::errors::BrokerError;
use crate::order_status::OrderStatusClient;
use crate::saga::handlers::{PerformHandler, RevertHandler};
use crate::saga::middleware::{apply_middleware, TaskHandler};
use crate::saga::step::SagaStep;
use crate::saga::{TaskContext, TaskState};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

/// Queue wiring and tuning for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub server_queue: String,
    pub next_queue: Option<String>,
    pub previous_queue: Option<String>,
    pub concurrency: usize,
    pub watch_timeout: Duration,
}

impl WorkerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            server_queue: settings.server_queue_name.clone(),
            next_queue: settings.next_queue().map(str::to_string),
            previous_queue: settings.previous_queue().map(str::to_string),
            concurrency: settings.worker_count,
            watch_timeout: settings.watch_timeout(),
        }
    }
}

/// Long-lived worker bound to one ServerQueue.
///
/// Spawns `concurrency` consumer tasks over the broker's `TaskSource`; each
/// incoming task gets a fresh `TaskContext` and runs through the middleware
/// chain. `shutdown()` stops pulling and lets in-flight handlers drain;
/// `abort()` additionally cancels them.
pub struct WorkerRuntime {
    source: Arc<dyn TaskSource>,
    producer: Arc<dyn TaskProducer>,
    inspector: Arc<dyn TaskInspector>,
    db: Option<PgPool>,

    options: WorkerOptions,
    breaker: Arc<CircuitBreaker>,
    order_status: OrderStatusClient,

    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    shutdown_token: CancellationToken,
    task_cancel: CancellationToken,
}

impl WorkerRuntime {
    pub fn new<B>(
        broker: Arc<B>,
        db: Option<PgPool>,
        breaker: Arc<CircuitBreaker>,
        order_status: OrderStatusClient,
        options: WorkerOptions,
    ) -> Self
    where
        B: TaskSource + TaskProducer + TaskInspector + 'static,
    {
        let source: Arc<dyn TaskSource> = broker.clone();
        let producer: Arc<dyn TaskProducer> = broker.clone();
        let inspector: Arc<dyn TaskInspector> = broker;

        Self {
            source,
            producer,
            inspector,
            db,
            options,
            breaker,
            order_status,
            handlers: HashMap::new(),
            shutdown_token: CancellationToken::new(),
            task_cancel: CancellationToken::new(),
        }
    }

    /// Register a handler for `topic`, wrapped in the middleware chain.
    pub fn register(&mut self, topic: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(topic.to_string(), apply_middleware(handler));
    }

    /// Register the saga step under both saga topics.
    pub fn register_step(&mut self, step: Arc<dyn SagaStep>) {
        self.register(TOPIC_PERFORM, Arc::new(PerformHandler::new(step.clone())));
        self.register(TOPIC_REVERT, Arc::new(RevertHandler::new(step)));
    }

    /// Stop pulling new tasks; in-flight handlers drain before `run` returns.
    pub fn shutdown(&self) {
        info!(queue = %self.options.server_queue, "worker shutdown requested");
        self.shutdown_token.cancel();
    }

    /// Stop pulling and cancel in-flight handlers.
    pub fn abort(&self) {
        warn!(queue = %self.options.server_queue, "worker abort requested");
        self.shutdown_token.cancel();
        self.task_cancel.cancel();
    }

    /// Run the consumer pool until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), BrokerError> {
        info!(
            queue = %self.options.server_queue,
            concurrency = self.options.concurrency,
            "worker runtime starting"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.options.concurrency {
            let runtime = Arc::clone(&self);
            workers.spawn(async move { runtime.consume_loop(worker_id).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "consumer task panicked");
            }
        }

        info!(queue = %self.options.server_queue, "worker runtime stopped");
        Ok(())
    }

    async fn consume_loop(&self, worker_id: usize) {
        debug!(worker_id, queue = %self.options.server_queue, "consumer started");

        // shutdown is checked between fetches rather than raced against
        // them, so a popped task is never dropped on the floor
        while !self.shutdown_token.is_cancelled() {
            match self.source.fetch(&self.options.server_queue).await {
                Ok(Some(task)) => self.process(task).await,
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "failed to fetch task");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        debug!(worker_id, "consumer drained");
    }

    async fn process(&self, task: TaskEnvelope) {
        let Some(handler) = self.handlers.get(&task.topic) else {
            warn!(topic = %task.topic, task_id = %task.id, "no handler registered for topic");
            let report = self
                .source
                .fail(&self.options.server_queue, &task.id, "unknown topic", false)
                .await;
            if let Err(err) = report {
                warn!(error = %err, task_id = %task.id, "failed to archive task");
            }
            return;
        };

        let mut ctx = self.new_task_context();
        let result = handler.handle(&task, &mut ctx).await;

        let report = match &result {
            Ok(()) => self.source.complete(&self.options.server_queue, &task.id).await,
            Err(err) => {
                self.source
                    .fail(
                        &self.options.server_queue,
                        &task.id,
                        &err.to_string(),
                        err.is_retriable(),
                    )
                    .await
            }
        };
        if let Err(err) = report {
            warn!(error = %err, task_id = %task.id, "failed to report task outcome");
        }
    }

    fn new_task_context(&self) -> TaskContext {
        TaskContext {
            producer: self.producer.clone(),
            inspector: self.inspector.clone(),
            db: self.db.clone(),
            server_queue: self.options.server_queue.clone(),
            next_queue: self.options.next_queue.clone(),
            previous_queue: self.options.previous_queue.clone(),
            breaker: self.breaker.clone(),
            order_status: self.order_status.clone(),
            span: Span::none(),
            task_state: TaskState::default(),
            watch_timeout: self.options.watch_timeout,
            cancel: self.task_cancel.child_token(),
        }
    }
}
