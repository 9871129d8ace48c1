use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::{BaggagePropagator, TextMapCompositePropagator, TraceContextPropagator},
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::{AppConfig, ENV_DEVELOPMENT, ENV_PRODUCTION};

const MAX_EXPORT_BATCH_SIZE: usize = 512;
const BATCH_SCHEDULED_DELAY: Duration = Duration::from_secs(5);
const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);
const TRACES_PATH: &str = "/v1/traces";

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Failed to initialize OpenTelemetry: {0}")]
    TracingInit(#[from] opentelemetry::trace::TraceError),
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
    #[error("Tracing shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
    #[error("Tracing shutdown task failed: {0}")]
    ShutdownTask(String),
}

/// Settings the trace pipeline is built from
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub endpoint: String,
}

impl From<&AppConfig> for TracingConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            service_version: config.service_version.clone(),
            environment: config.environment.clone(),
            endpoint: config.jaeger_endpoint.clone(),
        }
    }
}

/// A running trace pipeline: the SDK tracer for the tracing-subscriber
/// bridge and the callback that flushes it on shutdown.
pub struct TracingInstall {
    pub tracer: opentelemetry_sdk::trace::Tracer,
    pub shutdown: TracingShutdown,
}

/// Flushes and tears down the process-wide tracer provider.
#[derive(Debug)]
#[must_use]
pub struct TracingShutdown {
    installed: bool,
}

impl TracingShutdown {
    /// Shutdown callback used when tracing could not be initialized
    pub fn noop() -> Self {
        Self { installed: false }
    }

    fn installed() -> Self {
        Self { installed: true }
    }

    pub fn is_noop(&self) -> bool {
        !self.installed
    }

    /// Flush pending spans, giving up once `timeout` elapses
    pub async fn shutdown(self, timeout: Duration) -> Result<(), ObservabilityError> {
        if !self.installed {
            return Ok(());
        }

        info!("Shutting down tracing");

        // Dropping the provider blocks until the batch processor drains
        let shutdown_task = tokio::task::spawn_blocking(global::shutdown_tracer_provider);

        match tokio::time::timeout(timeout, shutdown_task).await {
            Ok(Ok(())) => {
                info!("Tracing shutdown completed successfully");
                Ok(())
            }
            Ok(Err(e)) => Err(ObservabilityError::ShutdownTask(e.to_string())),
            Err(_) => Err(ObservabilityError::ShutdownTimeout(timeout)),
        }
    }
}

/// Install the OTLP/HTTP trace pipeline as the process-wide tracer provider
/// together with the W3C trace-context and baggage propagators.
pub fn init_tracing(config: &TracingConfig) -> Result<TracingInstall, ObservabilityError> {
    info!(
        service = %config.service_name,
        environment = %config.environment,
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry tracer"
    );

    let exporter = opentelemetry_otlp::new_exporter()
        .http()
        .with_endpoint(collector_base_endpoint(&config.endpoint))
        .with_timeout(EXPORT_TIMEOUT);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            trace::config()
                .with_sampler(sampler_for_environment(&config.environment))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource(config)),
        )
        .with_batch_config(
            trace::BatchConfig::default()
                .with_max_export_batch_size(MAX_EXPORT_BATCH_SIZE)
                .with_scheduled_delay(BATCH_SCHEDULED_DELAY)
                .with_max_export_timeout(EXPORT_TIMEOUT),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    global::set_text_map_propagator(propagator());

    info!("OpenTelemetry tracer initialized successfully");
    Ok(TracingInstall {
        tracer,
        shutdown: TracingShutdown::installed(),
    })
}

/// W3C trace-context plus baggage
pub fn propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

fn resource(config: &TracingConfig) -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", config.service_version.clone()),
        KeyValue::new("deployment.environment", config.environment.clone()),
    ])
}

/// Fraction of traces kept for a deployment environment
pub fn sampling_ratio(environment: &str) -> f64 {
    match environment {
        ENV_PRODUCTION => 0.2,
        ENV_DEVELOPMENT => 1.0,
        _ => 0.5,
    }
}

pub fn sampler_for_environment(environment: &str) -> Sampler {
    match environment {
        ENV_DEVELOPMENT => Sampler::AlwaysOn,
        other => Sampler::TraceIdRatioBased(sampling_ratio(other)),
    }
}

/// The HTTP exporter appends the signal path itself, so a configured
/// `.../v1/traces` is trimmed back to the collector's base URL.
pub fn collector_base_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    trimmed
        .strip_suffix(TRACES_PATH)
        .unwrap_or(trimmed)
        .to_string()
}

/// Extract the current trace ID from the active span context
pub fn get_current_trace_id() -> Option<String> {
    current_trace_ids().map(|(trace_id, _)| trace_id)
}

/// Trace and span IDs of the active span, if it belongs to a valid trace
pub fn current_trace_ids() -> Option<(String, String)> {
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let current_span = tracing::Span::current();
    let context = current_span.context();
    let span = context.span();
    let span_context = span.span_context();

    if span_context.is_valid() {
        Some((
            span_context.trace_id().to_string(),
            span_context.span_id().to_string(),
        ))
    } else {
        None
    }
}

/// Macro to log info messages with trace ID
#[macro_export]
macro_rules! info_with_trace {
    ($($arg:tt)*) => {
        if let Some((trace_id, span_id)) = $crate::observability::tracing::current_trace_ids() {
            ::tracing::info!(trace_id = %trace_id, span_id = %span_id, $($arg)*);
        } else {
            ::tracing::info!($($arg)*);
        }
    };
}

/// Macro to log error messages with trace ID
#[macro_export]
macro_rules! error_with_trace {
    ($($arg:tt)*) => {
        if let Some((trace_id, span_id)) = $crate::observability::tracing::current_trace_ids() {
            ::tracing::error!(trace_id = %trace_id, span_id = %span_id, $($arg)*);
        } else {
            ::tracing::error!($($arg)*);
        }
    };
}

/// Macro to log warn messages with trace ID
#[macro_export]
macro_rules! warn_with_trace {
    ($($arg:tt)*) => {
        if let Some((trace_id, span_id)) = $crate::observability::tracing::current_trace_ids() {
            ::tracing::warn!(trace_id = %trace_id, span_id = %span_id, $($arg)*);
        } else {
            ::tracing::warn!($($arg)*);
        }
    };
}
