// Telemetry: structured logging, OTLP tracing, Prometheus metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize JSON logging plus the OTLP tracing pipeline.
///
/// `service_name` is the worker's ServerQueue so every step of a saga shows
/// up as its own service in the trace backend. Log level comes from
/// `RUST_LOG`, falling back to `info`.
pub fn init_telemetry(service_name: &str, otlp_endpoint: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_filter(env_filter);

    let tracer = init_tracer(service_name, otlp_endpoint)?;
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(json_layer)
        .with(telemetry_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(
        service_name = service_name,
        otlp_endpoint = otlp_endpoint,
        "telemetry initialized"
    );

    Ok(())
}

fn init_tracer(
    service_name: &str,
    endpoint: &str,
) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_string()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    Ok(tracer_provider.tracer("saga-worker"))
}

/// Flush remaining spans on graceful shutdown.
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe the saga metrics.
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "saga_task_success_total",
        "Total number of successfully processed saga tasks"
    );
    describe_counter!(
        "saga_task_failed_total",
        "Total number of failed saga tasks"
    );
    describe_histogram!(
        "saga_task_duration_seconds",
        "Duration of saga task handling in seconds"
    );

    tracing::info!(metrics_port, "Prometheus metrics exporter initialized");
    Ok(())
}

#[inline]
pub fn record_task_success(queue: &str, topic: &str) {
    counter!("saga_task_success_total", "queue" => queue.to_string(), "topic" => topic.to_string())
        .increment(1);
}

#[inline]
pub fn record_task_failure(queue: &str, topic: &str) {
    counter!("saga_task_failed_total", "queue" => queue.to_string(), "topic" => topic.to_string())
        .increment(1);
}

#[inline]
pub fn record_task_duration(queue: &str, topic: &str, duration_seconds: f64) {
    histogram!("saga_task_duration_seconds", "queue" => queue.to_string(), "topic" => topic.to_string())
        .record(duration_seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording_does_not_panic() {
        record_task_success("payments", "task:perform");
        record_task_failure("payments", "task:perform");
        record_task_duration("payments", "task:revert", 0.25);
    }
}
