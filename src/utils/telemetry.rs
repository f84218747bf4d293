//! Tracing Initialization
//!
//! Installs the global subscriber: `EnvFilter` from `RUST_LOG` plus a fmt
//! layer. With the `otel` feature, spans are also exported over OTLP.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const DEFAULT_FILTER: &str = "research_agency=info,tower_http=info";

/// Flushes exporters on drop; hold it for the life of the process
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    otel: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if self.otel {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

#[cfg(not(feature = "otel"))]
pub fn init_tracing(_service_name: &str) -> anyhow::Result<TelemetryGuard> {
    Registry::default()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;
    Ok(TelemetryGuard {})
}

#[cfg(feature = "otel")]
pub fn init_tracing(service_name: &str) -> anyhow::Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider;
    use opentelemetry::{global, KeyValue};
    use opentelemetry_sdk::{propagation::TraceContextPropagator, runtime, trace as sdktrace, Resource};

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .build_span_exporter()?;

    let trace_config = sdktrace::Config::default().with_resource(Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
    ]));

    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace_config)
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(service_name.to_string());
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    Registry::default()
        .with(env_filter())
        .with(telemetry)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    Ok(TelemetryGuard { otel: true })
}
