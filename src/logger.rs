use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Target of the structured routing events written to the event file.
pub const ROUTE_TARGET: &str = "route";
const SERVICE_NAME: &str = "jarvis-hub";

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

/// Keeps the OTLP providers alive; flushes them on drop.
#[derive(Default)]
pub struct TelemetryGuard {
    otlp: Option<OtlpProviders>,
}

struct OtlpProviders {
    logs: SdkLoggerProvider,
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(p) = self.otlp.take() {
            let _ = p.traces.shutdown();
            let _ = p.metrics.shutdown();
            let _ = p.logs.shutdown();
        }
    }
}

fn init_otlp(endpoint: &str) -> anyhow::Result<OtlpProviders> {
    let logs = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building the OTLP log exporter")?;
    let spans = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building the OTLP span exporter")?;
    let metrics = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building the OTLP metric exporter")?;

    Ok(OtlpProviders {
        logs: SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource())
            .build(),
        traces: SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource())
            .build(),
        metrics: SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource())
            .build(),
    })
}

/// Installs the global subscriber.
///
/// - plain text log, rotated daily, filtered by `log_level`
/// - JSON lines for `route` events in `event_file`
/// - with `otel_endpoint`: logs, spans and metrics exported over OTLP/HTTP
///
/// Both file paths are relative to `root`.
pub fn init_tracing(
    root: &Path,
    log_file: &str,
    event_file: &str,
    log_level: &str,
    otel_endpoint: Option<&str>,
) -> anyhow::Result<TelemetryGuard> {
    let log_path = root.join(log_file);
    let event_path = root.join(event_file);
    let (log_dir, log_name) = split(&log_path)?;
    let (event_dir, event_name) = split(&event_path)?;
    std::fs::create_dir_all(log_dir).with_context(|| format!("creating {}", log_dir.display()))?;
    std::fs::create_dir_all(event_dir).with_context(|| format!("creating {}", event_dir.display()))?;

    let txt_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, log_name))
        .with_filter(EnvFilter::new(log_level));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_writer(RollingFileAppender::new(Rotation::DAILY, event_dir, event_name))
        .with_filter(EnvFilter::new(format!("{ROUTE_TARGET}=debug")));

    let otlp = otel_endpoint.map(init_otlp).transpose()?;
    let otel_layer = match &otlp {
        Some(p) => {
            // the exporters' own transport logs would feed back into OTLP
            let mut filter = EnvFilter::new(log_level);
            for directive in ["hyper=off", "h2=off", "reqwest=off"] {
                filter = filter.add_directive(directive.parse()?);
            }
            Some(OpenTelemetryTracingBridge::new(&p.logs).with_filter(filter))
        }
        None => None,
    };

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| anyhow!("tracing already initialised: {e}"))?;

    if let Some(p) = &otlp {
        global::set_tracer_provider(p.traces.clone());
        global::set_meter_provider(p.metrics.clone());
    }
    Ok(TelemetryGuard { otlp })
}

fn split(path: &Path) -> anyhow::Result<(&Path, &std::ffi::OsStr)> {
    let dir = path.parent().ok_or_else(|| anyhow!("{} has no parent", path.display()))?;
    let name = path.file_name().ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    Ok((dir, name))
}

/// Routing counters, no-ops until a meter provider is installed.
#[derive(Clone)]
pub struct RouteMetrics {
    routed: Counter<u64>,
    dropped: Counter<u64>,
    activation_ms: Histogram<f64>,
}

impl Default for RouteMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RouteMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RouteMetrics")
    }
}

impl RouteMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            routed: meter
                .u64_counter("envelopes_routed")
                .with_description("Envelopes handed to a route")
                .build(),
            dropped: meter
                .u64_counter("envelopes_dropped")
                .with_description("Envelopes dropped as unroutable, undeliverable or malformed")
                .build(),
            activation_ms: meter
                .f64_histogram("activation_latency_ms")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn routed(&self, prefix: &str) {
        self.routed.add(1, &[KeyValue::new("prefix", prefix.to_string())]);
    }

    pub fn dropped(&self, reason: &'static str) {
        self.dropped.add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn activation(&self, millis: f64) {
        self.activation_ms.record(millis, &[]);
    }
}
