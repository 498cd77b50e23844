// Postgres connection pool for a step's local datastore

use crate::config::Settings;
use crate::errors::DatabaseError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect the step's datastore, or return `None` when no database is
/// configured (`DB_NAME` empty); a step without local state is valid.
#[instrument(skip(settings))]
pub async fn connect(settings: &Settings) -> Result<Option<PgPool>, DatabaseError> {
    let Some(url) = settings.database_url() else {
        info!("no database configured, step runs stateless");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&url)
        .await
        .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

    info!("database connection pool initialized");
    Ok(Some(pool))
}

/// Verify the pool answers a trivial query.
pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::HealthCheckFailed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_no_db_name_attaches_no_pool() {
        let settings: Settings =
            serde_json::from_value(json!({ "server_queue_name": "payments" })).unwrap();
        let pool = connect(&settings).await.unwrap();
        assert!(pool.is_none());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL to be running
    async fn test_connect_and_health_check() {
        let settings: Settings = serde_json::from_value(json!({
            "server_queue_name": "payments",
            "db_name": "saga",
            "db_user": "postgres",
            "db_password": "postgres",
            "db_address": "localhost:5432",
        }))
        .unwrap();

        let pool = connect(&settings).await.unwrap().unwrap();
        health_check(&pool).await.unwrap();
    }
}
