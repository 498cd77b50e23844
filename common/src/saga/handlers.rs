// Saga step coordinator: the `task:perform` and `task:revert` handlers
//
// Perform walks admit → breaker check → fail injection → local work →
// forward → downstream watch → annotate. Revert runs the local compensation
// and always propagates the compensation upstream, even when the local part
// failed.

use crate::broker::{TaskEnvelope, TOPIC_PERFORM, TOPIC_REVERT};
use crate::errors::{StepError, TaskError};
use crate::order_status::OrderStatus;
use crate::saga::context::{TaskContext, TaskState};
use crate::saga::middleware::TaskHandler;
use crate::saga::payload::StepPayload;
use crate::saga::step::SagaStep;
use crate::saga::watch;
use crate::trace::{self, TaskKind};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn, Instrument};

/// Handler for forward saga traffic.
pub struct PerformHandler {
    step: Arc<dyn SagaStep>,
}

impl PerformHandler {
    pub fn new(step: Arc<dyn SagaStep>) -> Self {
        Self { step }
    }
}

#[async_trait]
impl TaskHandler for PerformHandler {
    async fn handle(&self, task: &TaskEnvelope, ctx: &mut TaskContext) -> Result<(), TaskError> {
        // unmarshal failures are non-retriable and emit no compensation
        let mut payload = StepPayload::parse(&task.payload)?;

        let span = trace::task_span(
            &ctx.server_queue,
            TaskKind::Perform,
            &mut payload.saga.trace_carrier,
        );
        ctx.span = span.clone();

        let result = perform_inner(self.step.as_ref(), &payload, ctx)
            .instrument(span)
            .await;
        match &result {
            Ok(()) => ctx.task_succeeded(),
            Err(err) => ctx.task_failed(err),
        }
        result
    }
}

async fn perform_inner(
    step: &dyn SagaStep,
    payload: &StepPayload,
    ctx: &mut TaskContext,
) -> Result<(), TaskError> {
    // admission: an open breaker answers for the whole downstream chain
    if ctx.breaker.is_open() {
        warn!(queue = %ctx.server_queue, "circuit breaker open, refusing task");
        report_status(ctx, payload, OrderStatus::DefaultResponse).await;
        log_compensation_failure(revert_previous(ctx, payload).await);
        return Err(TaskError::BreakerOpen {
            queue: ctx.server_queue.clone(),
        });
    }

    // chaos hook: payload can designate this queue to fail synthetically
    if payload.saga.fail_trigger.as_deref() == Some(ctx.server_queue.as_str()) {
        warn!(queue = %ctx.server_queue, "fail trigger matched, failing saga");
        report_status(ctx, payload, OrderStatus::ForcedFail).await;
        log_compensation_failure(revert_previous(ctx, payload).await);
        return Err(TaskError::ForcedFail {
            queue: ctx.server_queue.clone(),
        });
    }

    let cancel = ctx.cancel.clone();
    let local = tokio::select! {
        _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        result = perform_step(step, payload, ctx) => result,
    };

    let next_fields = match local {
        Ok(fields) => fields,
        Err(err) => {
            if let TaskError::Step(StepError::Business { status, .. }) = &err {
                report_status(ctx, payload, *status).await;
            }
            log_compensation_failure(revert_previous(ctx, payload).await);
            return Err(err);
        }
    };

    // terminal step: nothing to forward, saga ends here
    let Some(next_queue) = ctx.next_queue.clone() else {
        return Ok(());
    };

    let task_id = match perform_next(ctx, payload, next_fields, &next_queue).await {
        Ok(task_id) => task_id,
        Err(err) => {
            // the forward hop never materialized, so no downstream worker
            // will ever compensate us; we have to revert ourselves
            revert_self(ctx, payload).await;
            return Err(err);
        }
    };

    let (state, last_err) = tokio::select! {
        _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        outcome = watch::downstream_state(
            ctx.inspector.as_ref(),
            &ctx.breaker,
            &next_queue,
            &task_id,
            ctx.watch_timeout,
        ) => outcome,
    };
    ctx.task_state = state;
    ctx.add_span_state_event();

    match state {
        TaskState::Expired => {
            revert_self(ctx, payload).await;
            Err(TaskError::DownstreamExpired { queue: next_queue })
        }
        // the failed downstream worker emits its own revert chain back to us
        TaskState::Failed => Err(TaskError::DownstreamFailed {
            queue: next_queue,
            last_err: last_err.unwrap_or_default(),
        }),
        TaskState::Done => Ok(()),
    }
}

/// Run the step's forward hook inside a local transaction when a datastore
/// is attached. An error drops the transaction, rolling back the side
/// effects.
async fn perform_step(
    step: &dyn SagaStep,
    payload: &StepPayload,
    ctx: &TaskContext,
) -> Result<Map<String, Value>, TaskError> {
    match &ctx.db {
        Some(pool) => {
            let mut tx = pool.begin().await.map_err(TaskError::Transaction)?;
            let fields = step.perform(payload, Some(&mut tx), ctx).await?;
            tx.commit().await.map_err(TaskError::Transaction)?;
            Ok(fields)
        }
        None => Ok(step.perform(payload, None, ctx).await?),
    }
}

/// Handler for compensating saga traffic.
pub struct RevertHandler {
    step: Arc<dyn SagaStep>,
}

impl RevertHandler {
    pub fn new(step: Arc<dyn SagaStep>) -> Self {
        Self { step }
    }
}

#[async_trait]
impl TaskHandler for RevertHandler {
    async fn handle(&self, task: &TaskEnvelope, ctx: &mut TaskContext) -> Result<(), TaskError> {
        let mut payload = StepPayload::parse(&task.payload)?;

        let span = trace::task_span(
            &ctx.server_queue,
            TaskKind::Revert,
            &mut payload.saga.trace_carrier,
        );
        ctx.span = span.clone();

        let result = revert_inner(self.step.as_ref(), &payload, ctx)
            .instrument(span)
            .await;
        match &result {
            Ok(()) => ctx.task_succeeded(),
            Err(err) => ctx.task_failed(err),
        }
        result
    }
}

async fn revert_inner(
    step: &dyn SagaStep,
    payload: &StepPayload,
    ctx: &mut TaskContext,
) -> Result<(), TaskError> {
    let cancel = ctx.cancel.clone();
    let local = tokio::select! {
        _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        result = revert_step(step, payload, ctx) => result,
    };
    if let Err(err) = &local {
        warn!(queue = %ctx.server_queue, error = %err, "local compensation failed");
    }

    // the compensation wave keeps rolling upstream regardless of the local
    // outcome; a failed enqueue is returned as-is, never compensated again
    revert_previous(ctx, payload).await?;

    ctx.add_span_state_event();
    local
}

async fn revert_step(
    step: &dyn SagaStep,
    payload: &StepPayload,
    ctx: &TaskContext,
) -> Result<(), TaskError> {
    match &ctx.db {
        Some(pool) => {
            let mut tx = pool.begin().await.map_err(TaskError::Transaction)?;
            step.revert(payload, Some(&mut tx), ctx).await?;
            tx.commit().await.map_err(TaskError::Transaction)?;
            Ok(())
        }
        None => Ok(step.revert(payload, None, ctx).await?),
    }
}

/// Forward the saga: business fields plus the saga envelope, retry disabled.
async fn perform_next(
    ctx: &TaskContext,
    payload: &StepPayload,
    mut fields: Map<String, Value>,
    next_queue: &str,
) -> Result<String, TaskError> {
    if let Some(trigger) = &payload.saga.fail_trigger {
        fields.insert("fail_trigger".to_string(), Value::from(trigger.clone()));
    }
    if let Some(carrier) = &payload.saga.trace_carrier {
        fields.insert(
            "trace_carrier".to_string(),
            serde_json::to_value(carrier).unwrap_or(Value::Null),
        );
    }

    let bytes = serde_json::to_vec(&Value::Object(fields))?;
    let task_id = ctx
        .producer
        .enqueue(TOPIC_PERFORM, &bytes, next_queue, 0)
        .await?;

    info!(next_queue, task_id = %task_id, "forwarded saga to next step");
    Ok(task_id)
}

/// Enqueue `{order_id, trace_carrier}` onto PreviousQueue; a no-op at the
/// head of the chain.
async fn revert_previous(ctx: &TaskContext, payload: &StepPayload) -> Result<(), TaskError> {
    let Some(previous_queue) = ctx.previous_queue.as_deref() else {
        return Ok(());
    };

    let bytes = serde_json::to_vec(&Value::Object(payload.compensation()))?;
    let task_id = ctx
        .producer
        .enqueue(TOPIC_REVERT, &bytes, previous_queue, 0)
        .await?;

    info!(previous_queue, task_id = %task_id, "compensation enqueued upstream");
    Ok(())
}

/// Enqueue a revert for this worker onto its own queue. Used when a forward
/// hop never produced a downstream executor that could compensate us later.
async fn revert_self(ctx: &TaskContext, payload: &StepPayload) {
    let bytes = match serde_json::to_vec(payload) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to serialize self-revert payload");
            return;
        }
    };

    match ctx
        .producer
        .enqueue(TOPIC_REVERT, &bytes, &ctx.server_queue, 0)
        .await
    {
        Ok(task_id) => info!(queue = %ctx.server_queue, task_id = %task_id, "self-revert enqueued"),
        Err(err) => warn!(queue = %ctx.server_queue, error = %err, "failed to enqueue self-revert"),
    }
}

/// Best-effort status report; failures only show up in the logs and span.
async fn report_status(ctx: &TaskContext, payload: &StepPayload, status: OrderStatus) {
    let Some(order_id) = payload.order_id else {
        warn!(?status, "payload has no order_id, skipping status report");
        return;
    };
    if let Err(err) = ctx.order_status.set_order_status(order_id, status).await {
        warn!(order_id, ?status, error = %err, "failed to report order status");
    }
}

fn log_compensation_failure(result: Result<(), TaskError>) {
    if let Err(err) = result {
        warn!(error = %err, "failed to enqueue compensation upstream");
    }
}
