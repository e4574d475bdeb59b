//! Tracing subscriber and OpenTelemetry export for the outbox.
//!
//! Log lines always go to stderr. When an OTLP endpoint is configured,
//! spans, metrics and log records are exported there as well, tagged with
//! the configured service name.

pub mod delivery;
pub mod metrics;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::config::OutboxConfig;
use crate::error::{Error, Result};

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Optional OTLP endpoint (e.g. "http://localhost:4317").
    pub endpoint: Option<String>,
    /// Service name on every exported signal; also names the tracer.
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset (e.g. "info", "outbox_sender=debug").
    pub log_level: String,
}

impl From<&OutboxConfig> for TelemetryConfig {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: config.service_name.clone(),
            log_level: config.log_level.clone(),
        }
    }
}

/// OTLP providers for one endpoint.
struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Exporters {
    fn build(endpoint: &str, service_name: &str) -> Result<Self> {
        let resource = Resource::builder()
            .with_service_name(service_name.to_string())
            .build();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let tracer = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let meter = SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource.clone())
            .build();

        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;
        let logger = SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build();

        Ok(Self {
            tracer,
            meter,
            logger,
        })
    }
}

fn exporter_error(signal: &str, err: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {err}"))
}

/// Keeps the OTLP pipelines alive. Dropping it flushes and shuts them down.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    /// Whether signals are being exported beyond stderr.
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }

    /// Force-flush all telemetry pipelines.
    pub fn force_flush(&self) {
        if let Some(ref exporters) = self.exporters {
            let _ = exporters.tracer.force_flush();
            let _ = exporters.meter.force_flush();
            let _ = exporters.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            let _ = exporters.logger.shutdown();
            let _ = exporters.meter.shutdown();
            let _ = exporters.tracer.shutdown();
        }
    }
}

/// Install the global subscriber and, with an endpoint, the OTLP pipelines.
///
/// Hold the returned guard for the lifetime of the process.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let exporters = config
        .endpoint
        .as_deref()
        .map(|endpoint| Exporters::build(endpoint, &config.service_name))
        .transpose()?;

    let trace_layer = exporters.as_ref().map(|e| {
        tracing_opentelemetry::layer().with_tracer(e.tracer.tracer(config.service_name.clone()))
    });
    let log_layer = exporters
        .as_ref()
        .map(|e| opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&e.logger));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    if let Some(ref e) = exporters {
        opentelemetry::global::set_meter_provider(e.meter.clone());
    }

    Ok(TelemetryGuard { exporters })
}
