//! Tracing, metrics and log export for the pipeline.
//!
//! With an OTLP collector configured, spans, instruments and log records are
//! exported over gRPC alongside a compact stderr formatter. Without one, only
//! the formatter is installed and metric instruments record into the no-op
//! global provider.

pub mod dispatch;
pub mod metrics;

use crate::error::{Error, Result};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

pub struct TelemetryConfig {
    /// OTLP gRPC collector, e.g. `http://otel-collector:4317`.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Owns the export pipelines. Dropping it shuts them down, flushing pending data.
#[derive(Default)]
pub struct TelemetryGuard {
    pipelines: Option<Pipelines>,
}

struct Pipelines {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl TelemetryGuard {
    /// Push buffered spans, metrics and logs to the collector now.
    pub fn force_flush(&self) {
        if let Some(p) = &self.pipelines {
            let _ = p.traces.force_flush();
            let _ = p.metrics.force_flush();
            let _ = p.logs.force_flush();
        }
    }

    pub fn is_exporting(&self) -> bool {
        self.pipelines.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(p) = self.pipelines.take() {
            let _ = p.logs.shutdown();
            let _ = p.metrics.shutdown();
            let _ = p.traces.shutdown();
        }
    }
}

fn resource(service_name: String) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build()
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to build OTLP {signal} exporter: {e}"))
}

fn build_pipelines(endpoint: &str, resource: Resource) -> Result<Pipelines> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    let traces = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();

    let instruments = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    let metrics = SdkMeterProvider::builder()
        .with_periodic_exporter(instruments)
        .with_resource(resource.clone())
        .build();

    let records = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;
    let logs = SdkLoggerProvider::builder()
        .with_batch_exporter(records)
        .with_resource(resource)
        .build();

    Ok(Pipelines {
        traces,
        metrics,
        logs,
    })
}

/// Install the global subscriber and, when an endpoint is set, the OTLP
/// pipelines and global meter provider.
///
/// Fails if an exporter cannot be built or a global subscriber is
/// already installed in this process.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let subscriber_error = |e: tracing_subscriber::util::TryInitError| {
        Error::Other(format!("failed to install tracing subscriber: {e}"))
    };

    let Some(endpoint) = config.endpoint else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard::default());
    };

    let pipelines = build_pipelines(&endpoint, resource(config.service_name))?;
    opentelemetry::global::set_meter_provider(pipelines.metrics.clone());

    let tracer = pipelines.traces.tracer("axnc-rs");
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
            &pipelines.logs,
        ))
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard {
        pipelines: Some(pipelines),
    })
}
