// Saga step engine: payloads, per-task context, handlers, middleware

pub mod context;
pub mod handlers;
pub mod middleware;
pub mod payload;
pub mod step;
pub mod watch;

pub use context::{TaskContext, TaskState};
pub use handlers::{PerformHandler, RevertHandler};
pub use middleware::{apply_middleware, TaskHandler};
pub use payload::{SagaPayload, StepPayload};
pub use step::{SagaStep, StepTx};
