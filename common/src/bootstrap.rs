// Bootstrap utilities for the worker binary

use crate::broker::RedisBroker;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::Settings;
use crate::db;
use crate::order_status::OrderStatusClient;
use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

/// Connect the Redis broker.
pub async fn init_broker(settings: &Settings) -> Result<Arc<RedisBroker>> {
    let broker = RedisBroker::connect(&settings.redis_addr)
        .await
        .context("failed to connect to redis broker")?;
    broker
        .health_check()
        .await
        .context("redis broker health check failed")?;
    Ok(Arc::new(broker))
}

/// Connect the step's datastore; `None` when no database is configured.
pub async fn init_database(settings: &Settings) -> Result<Option<PgPool>> {
    let pool = db::connect(settings)
        .await
        .context("failed to connect to database")?;
    if pool.is_none() {
        info!("worker running without a database");
    }
    Ok(pool)
}

/// Build the process-wide circuit breaker from settings.
pub fn init_breaker(settings: &Settings) -> Arc<CircuitBreaker> {
    CircuitBreaker::new(CircuitBreakerConfig {
        max_consecutive_fails: settings.breaker_max_consecutive_fails,
        open_interval: settings.breaker_open_interval(),
    })
}

/// Build the order-service client.
pub fn init_order_status(settings: &Settings) -> Result<OrderStatusClient> {
    OrderStatusClient::new(settings.order_svc_addr.clone())
        .context("failed to build order-service client")
}
