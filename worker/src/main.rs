// Worker binary entry point: one saga step bound to one server queue

mod step;

use anyhow::Result;
use common::config::Settings;
use common::worker::{WorkerOptions, WorkerRuntime};
use common::{bootstrap, telemetry};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;

    telemetry::init_telemetry(
        &settings.server_queue_name,
        &settings.otel_exporter_otlp_endpoint,
    )?;
    telemetry::init_metrics(settings.metrics_port)?;

    info!(
        server_queue = %settings.server_queue_name,
        next_queue = %settings.next_queue_name,
        previous_queue = %settings.previous_queue_name,
        "starting saga-step worker"
    );

    let broker = bootstrap::init_broker(&settings).await?;
    let db = bootstrap::init_database(&settings).await?;
    let breaker = bootstrap::init_breaker(&settings);
    let order_status = bootstrap::init_order_status(&settings)?;

    let mut runtime = WorkerRuntime::new(
        broker,
        db,
        breaker,
        order_status,
        WorkerOptions::from_settings(&settings),
    );
    runtime.register_step(Arc::new(step::TemplateStep));
    let runtime = Arc::new(runtime);

    let worker_handle = tokio::spawn(runtime.clone().run());

    info!("worker is running, press Ctrl+C to shut down");
    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
    }

    runtime.shutdown();
    info!("waiting for in-flight tasks to drain");
    if let Ok(Err(err)) = worker_handle.await {
        error!(error = %err, "worker runtime exited with error");
    }

    telemetry::shutdown_tracer();
    info!("worker shutdown complete");
    Ok(())
}
