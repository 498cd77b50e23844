// The concrete step for this worker
//
// Template placeholder: forwards the payload unchanged and fails on demand
// via `action: "err"`. A real deployment replaces this with the step's
// business logic (payment, inventory reservation, shipping, ...), using the
// open transaction for its local side effects.

use async_trait::async_trait;
use common::errors::StepError;
use common::saga::{SagaStep, StepPayload, StepTx, TaskContext};
use serde_json::{Map, Value};
use tracing::info;

pub struct TemplateStep;

#[async_trait]
impl SagaStep for TemplateStep {
    async fn perform(
        &self,
        payload: &StepPayload,
        _tx: Option<&mut StepTx<'_>>,
        _ctx: &TaskContext,
    ) -> Result<Map<String, Value>, StepError> {
        if payload.action.as_deref() == Some("err") {
            return Err(StepError::Other("test error requested".to_string()));
        }

        info!(order_id = ?payload.order_id, "template step performed");
        Ok(payload.business_fields())
    }

    async fn revert(
        &self,
        payload: &StepPayload,
        _tx: Option<&mut StepTx<'_>>,
        _ctx: &TaskContext,
    ) -> Result<(), StepError> {
        info!(order_id = ?payload.order_id, "template step reverted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::broker::MemoryBroker;
    use common::circuit_breaker::CircuitBreaker;
    use common::order_status::OrderStatusClient;
    use common::saga::TaskState;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> TaskContext {
        let broker = Arc::new(MemoryBroker::new());
        TaskContext {
            producer: broker.clone(),
            inspector: broker,
            db: None,
            server_queue: "template".to_string(),
            next_queue: None,
            previous_queue: None,
            breaker: CircuitBreaker::with_defaults(),
            order_status: OrderStatusClient::new("127.0.0.1:1").unwrap(),
            span: tracing::Span::none(),
            task_state: TaskState::default(),
            watch_timeout: Duration::from_millis(20),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_perform_passes_business_fields_through() {
        let payload: StepPayload =
            serde_json::from_value(json!({ "order_id": 7, "amount": 2 })).unwrap();

        let fields = TemplateStep
            .perform(&payload, None, &ctx())
            .await
            .unwrap();

        assert_eq!(fields["order_id"], json!(7));
        assert_eq!(fields["amount"], json!(2));
    }

    #[tokio::test]
    async fn test_perform_fails_when_action_is_err() {
        let payload: StepPayload = serde_json::from_value(json!({ "action": "err" })).unwrap();
        let result = TemplateStep.perform(&payload, None, &ctx()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_revert_is_a_no_op() {
        let payload = StepPayload::default();
        assert!(TemplateStep.revert(&payload, None, &ctx()).await.is_ok());
    }
}
