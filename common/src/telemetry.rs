// Telemetry module for structured logging, metrics, and tracing

use crate::config::{LogFormat, ObservabilityConfig};
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging
///
/// `RUST_LOG` wins over the configured level. JSON output carries the current
/// span and span list so `job_id` / `channel` fields from instrumented calls
/// land on every line. When a tracing endpoint is configured an OpenTelemetry
/// layer is added as well.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    let registry = tracing_subscriber::registry().with(fmt_layer);

    if let Some(endpoint) = config.tracing_endpoint.as_deref() {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = %config.log_level,
        log_format = ?config.log_format,
        tracing_endpoint = config.tracing_endpoint.as_deref(),
        "Logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", "chronocast"),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer("chronocast");

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Shutdown OpenTelemetry tracer provider, flushing remaining spans
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus recorder and describe every metric
///
/// The returned handle renders the scrape body served at `/metrics`.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    describe_counter!(
        "scheduler_job_success_total",
        "Total number of successful job invocations"
    );
    describe_counter!(
        "scheduler_job_failed_total",
        "Total number of failed job invocations"
    );
    describe_counter!(
        "scheduler_job_misfired_total",
        "Firings dropped because they were later than the misfire grace window"
    );
    describe_counter!(
        "scheduler_job_skipped_total",
        "Firings skipped because the previous invocation was still running"
    );
    describe_histogram!(
        "scheduler_job_duration_seconds",
        "Duration of job invocations in seconds"
    );
    describe_gauge!("scheduler_live_jobs", "Jobs installed in the live engine");
    describe_counter!(
        "broadcast_published_total",
        "Messages published to the notification bus"
    );
    describe_counter!(
        "broadcast_delivered_total",
        "Messages written to local WebSocket connections"
    );
    describe_counter!(
        "broadcast_pruned_total",
        "Connections pruned after a failed send"
    );
    describe_counter!(
        "broadcast_subscriber_reconnects_total",
        "Subscriber loop reconnect attempts"
    );
    describe_gauge!("broadcast_connections", "Live local WebSocket connections");
    describe_gauge!(
        "broadcast_subscriber_up",
        "1 while the bus subscriber holds a live subscription"
    );

    tracing::info!("Prometheus metrics recorder installed");

    Ok(handle)
}

#[inline]
pub fn record_job_success(job_id: &str, job_name: &str) {
    counter!("scheduler_job_success_total", "job_id" => job_id.to_string(), "job_name" => job_name.to_string()).increment(1);
}

#[inline]
pub fn record_job_failure(job_id: &str, job_name: &str, reason: &str) {
    counter!(
        "scheduler_job_failed_total",
        "job_id" => job_id.to_string(),
        "job_name" => job_name.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_duration(job_id: &str, job_name: &str, duration_seconds: f64) {
    histogram!(
        "scheduler_job_duration_seconds",
        "job_id" => job_id.to_string(),
        "job_name" => job_name.to_string()
    )
    .record(duration_seconds);
}

#[inline]
pub fn record_job_misfire(job_id: &str) {
    counter!("scheduler_job_misfired_total", "job_id" => job_id.to_string()).increment(1);
}

#[inline]
pub fn record_job_skipped(job_id: &str) {
    counter!("scheduler_job_skipped_total", "job_id" => job_id.to_string()).increment(1);
}

#[inline]
pub fn update_live_jobs(count: usize) {
    gauge!("scheduler_live_jobs").set(count as f64);
}

/// `route` is `relay` when the message went through the transport and
/// `local` when it fell back to in-process delivery.
#[inline]
pub fn record_broadcast_published(route: &'static str) {
    counter!("broadcast_published_total", "route" => route).increment(1);
}

#[inline]
pub fn record_broadcast_delivered(count: usize) {
    counter!("broadcast_delivered_total").increment(count as u64);
}

#[inline]
pub fn record_connections_pruned(count: usize) {
    counter!("broadcast_pruned_total").increment(count as u64);
}

#[inline]
pub fn record_subscriber_reconnect() {
    counter!("broadcast_subscriber_reconnects_total").increment(1);
}

#[inline]
pub fn update_connection_count(count: usize) {
    gauge!("broadcast_connections").set(count as f64);
}

#[inline]
pub fn update_subscriber_up(up: bool) {
    gauge!("broadcast_subscriber_up").set(if up { 1.0 } else { 0.0 });
}
