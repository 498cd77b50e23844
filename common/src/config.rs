// Configuration loaded from the environment
//
// The worker is configured entirely through environment variables so the
// same image can be deployed once per saga step with different queue wiring.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

fn default_redis_addr() -> String {
    "localhost:6379".to_string()
}

fn default_db_address() -> String {
    "localhost:5432".to_string()
}

fn default_db_user() -> String {
    "user".to_string()
}

fn default_db_password() -> String {
    "password".to_string()
}

fn default_order_svc_addr() -> String {
    "localhost:5001".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_worker_count() -> usize {
    5
}

fn default_watch_timeout_secs() -> u64 {
    10
}

fn default_breaker_max_fails() -> u32 {
    5
}

fn default_breaker_open_interval_ms() -> u64 {
    2_000
}

fn default_metrics_port() -> u16 {
    9090
}

/// Worker settings, one field per environment variable.
///
/// `SERVER_QUEUE_NAME` is the only required variable. `DB_NAME` left empty
/// means the step runs without a datastore. Empty `NEXT_QUEUE_NAME` /
/// `PREVIOUS_QUEUE_NAME` mark the terminal / initial step of the chain.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_redis_addr")]
    pub redis_addr: String,

    #[serde(default = "default_db_address")]
    pub db_address: String,
    #[serde(default = "default_db_user")]
    pub db_user: String,
    #[serde(default = "default_db_password")]
    pub db_password: String,
    #[serde(default)]
    pub db_name: String,

    pub server_queue_name: String,
    #[serde(default)]
    pub next_queue_name: String,
    #[serde(default)]
    pub previous_queue_name: String,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_order_svc_addr")]
    pub order_svc_addr: String,

    #[serde(default = "default_otel_endpoint")]
    pub otel_exporter_otlp_endpoint: String,

    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u64,

    #[serde(default = "default_breaker_max_fails")]
    pub breaker_max_consecutive_fails: u32,
    #[serde(default = "default_breaker_open_interval_ms")]
    pub breaker_open_interval_ms: u64,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate().map_err(ConfigError::Message)?;
        Ok(settings)
    }

    /// Validate settings that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_queue_name.is_empty() {
            return Err("SERVER_QUEUE_NAME cannot be empty".to_string());
        }
        if self.worker_count == 0 {
            return Err("WORKER_COUNT must be greater than 0".to_string());
        }
        if self.breaker_max_consecutive_fails == 0 {
            return Err("BREAKER_MAX_CONSECUTIVE_FAILS must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Postgres connection URL, or `None` when no datastore is attached.
    pub fn database_url(&self) -> Option<String> {
        if self.db_name.is_empty() {
            return None;
        }
        Some(format!(
            "postgres://{}:{}@{}/{}",
            self.db_user, self.db_password, self.db_address, self.db_name
        ))
    }

    pub fn next_queue(&self) -> Option<&str> {
        if self.next_queue_name.is_empty() {
            None
        } else {
            Some(&self.next_queue_name)
        }
    }

    pub fn previous_queue(&self) -> Option<&str> {
        if self.previous_queue_name.is_empty() {
            None
        } else {
            Some(&self.previous_queue_name)
        }
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }

    pub fn breaker_open_interval(&self) -> Duration {
        Duration::from_millis(self.breaker_open_interval_ms)
    }
}
