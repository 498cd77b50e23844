// The template hooks a concrete worker fills in

use crate::errors::StepError;
use crate::saga::context::TaskContext;
use crate::saga::payload::StepPayload;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Open transaction on the step's local datastore.
pub type StepTx<'t> = sqlx::Transaction<'t, sqlx::Postgres>;

/// One step of the saga: the forward action and its compensation.
///
/// Both hooks run inside a local database transaction when the worker has a
/// datastore attached (`tx` is `Some`): returning an error aborts it. The
/// engine enqueues each hop at most once, so both hooks must be idempotent;
/// in particular `revert` may run for a `perform` that never completed.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Execute the step's local side effect. On success, return the business
    /// fields to forward downstream; the coordinator merges in the saga
    /// envelope (`fail_trigger`, `trace_carrier`) before enqueuing.
    async fn perform(
        &self,
        payload: &StepPayload,
        tx: Option<&mut StepTx<'_>>,
        ctx: &TaskContext,
    ) -> Result<Map<String, Value>, StepError>;

    /// Undo the step's local side effect.
    async fn revert(
        &self,
        payload: &StepPayload,
        tx: Option<&mut StepTx<'_>>,
        ctx: &TaskContext,
    ) -> Result<(), StepError>;
}
