// Distributed trace propagation through task payloads
//
// The carrier is a plain string map using W3C Trace Context keys, serialized
// inside every saga payload so spans emitted by independent workers join one
// trace. The head of the chain writes the carrier; downstream hops only read
// it and pass it along untouched.

use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use std::collections::HashMap;
use tracing::{debug, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Text-map carrier embedded in payloads (`traceparent`, `baggage`, ...).
pub type TraceCarrier = HashMap<String, String>;

/// Which saga topic a handler is serving; names the span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Perform,
    Revert,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Perform => "perform",
            TaskKind::Revert => "revert",
        }
    }
}

fn propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Open the span for one task invocation, named `"{queue}.{perform|revert}"`.
///
/// A non-empty carrier parents the span to the remote context. An absent or
/// empty carrier means this worker is the head of the trace: a root span is
/// started and its context is written back into `carrier` so every later hop
/// (forward or compensating) inherits it.
pub fn task_span(server_queue: &str, kind: TaskKind, carrier: &mut Option<TraceCarrier>) -> Span {
    let name = format!("{}.{}", server_queue, kind.as_str());
    let span = tracing::info_span!(
        "saga.task",
        otel.name = %name,
        queue = %server_queue,
        kind = kind.as_str(),
        otel.status_code = tracing::field::Empty,
        otel.status_message = tracing::field::Empty,
    );

    let propagator = propagator();
    match carrier {
        Some(map) if !map.is_empty() => {
            debug!(queue = %server_queue, "joining parent trace");
            let parent = propagator.extract(&*map);
            span.set_parent(parent);
        }
        _ => {
            debug!(queue = %server_queue, "starting a new trace");
            let mut fresh = TraceCarrier::new();
            propagator.inject_context(&span.context(), &mut fresh);
            *carrier = Some(fresh);
        }
    }

    span
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
    use tracing_subscriber::layer::SubscriberExt;

    fn with_otel_subscriber(f: impl FnOnce()) {
        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let tracer = provider.tracer("test");
        let subscriber =
            tracing_subscriber::registry().with(tracing_opentelemetry::layer().with_tracer(tracer));
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn test_root_span_fills_empty_carrier() {
        with_otel_subscriber(|| {
            let mut carrier = None;
            let span = task_span("payments", TaskKind::Perform, &mut carrier);
            drop(span);

            let map = carrier.expect("carrier written back");
            assert!(map.contains_key("traceparent"));
        });
    }

    #[test]
    fn test_existing_carrier_is_not_overwritten() {
        let seeded: TraceCarrier = [(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        )]
        .into_iter()
        .collect();

        let mut carrier = Some(seeded.clone());
        let _span = task_span("inventory", TaskKind::Revert, &mut carrier);
        assert_eq!(carrier, Some(seeded));
    }

    #[test]
    fn test_child_span_shares_trace_id_with_head() {
        with_otel_subscriber(|| {
            let mut carrier = None;
            let head = task_span("payments", TaskKind::Perform, &mut carrier);
            let head_trace = head.context().span().span_context().trace_id();
            drop(head);

            let mut downstream = carrier.clone();
            let child = task_span("inventory", TaskKind::Perform, &mut downstream);
            let child_trace = child.context().span().span_context().trace_id();

            assert_eq!(head_trace, child_trace);
            // downstream hop left the carrier untouched
            assert_eq!(downstream, carrier);
        });
    }

    #[test]
    fn test_empty_map_counts_as_absent_carrier() {
        with_otel_subscriber(|| {
            let mut carrier = Some(TraceCarrier::new());
            let _span = task_span("payments", TaskKind::Perform, &mut carrier);
            assert!(carrier.is_some_and(|map| map.contains_key("traceparent")));
        });
    }
}
