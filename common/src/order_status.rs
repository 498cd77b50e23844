// Order-service client: reports saga-level failure outcomes
//
// Reporting is best-effort by contract; callers log errors and move on.

use crate::errors::OrderStatusError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};

/// Saga outcome reported to the order service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    ForcedFail,
    PaymentFailInsufficient,
    DefaultResponse,
}

/// HTTP client for `PUT /fail/{order_id}` on the order service.
#[derive(Debug, Clone)]
pub struct OrderStatusClient {
    client: reqwest::Client,
    addr: String,
}

impl OrderStatusClient {
    pub fn new(addr: impl Into<String>) -> Result<Self, OrderStatusError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OrderStatusError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            addr: addr.into(),
        })
    }

    /// Mark `order_id` failed with the given status. 2xx counts as success;
    /// any other response is an error for the caller to log.
    #[instrument(skip(self), fields(addr = %self.addr))]
    pub async fn set_order_status(
        &self,
        order_id: u64,
        status: OrderStatus,
    ) -> Result<(), OrderStatusError> {
        let url = format!("http://{}/fail/{}", self.addr, order_id);

        let response = self
            .client
            .put(&url)
            .json(&json!({ "order_status": status }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OrderStatusError::UnexpectedStatus(response.status()));
        }

        debug!(order_id, ?status, "order status reported");
        Ok(())
    }
}
