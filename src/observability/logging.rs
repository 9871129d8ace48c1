use opentelemetry_sdk::trace::Tracer;
use tracing::info;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter,
    Layer, Registry,
};

use super::ObservabilityError;
use crate::config::LoggingConfig;

type TraceLayer = Option<OpenTelemetryLayer<Registry, Tracer>>;

/// Handle to the installed subscriber. The OpenTelemetry bridge starts
/// empty and is filled in once the trace pipeline is running, so logging
/// works from the first line of `main` whether or not tracing comes up.
pub struct LogHandle {
    trace_layer: reload::Handle<TraceLayer, Registry>,
}

impl LogHandle {
    /// Route spans to the given tracer from now on
    pub fn attach_tracer(&self, tracer: Tracer) -> Result<(), ObservabilityError> {
        let layer: TraceLayer = Some(tracing_opentelemetry::layer().with_tracer(tracer));
        self.trace_layer
            .reload(layer)
            .map_err(|e| ObservabilityError::Logging(e.to_string()))
    }

    /// A handle not connected to any subscriber
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (_layer, trace_layer) = reload::Layer::<TraceLayer, Registry>::new(None);
        Self { trace_layer }
    }
}

/// Install the process-wide subscriber: env filter, JSON or human-readable
/// output, and an initially empty OpenTelemetry bridge.
pub fn init_logging(
    config: &LoggingConfig,
    service_name: &str,
) -> Result<LogHandle, ObservabilityError> {
    let (trace_layer, handle) = reload::Layer::new(None::<OpenTelemetryLayer<Registry, Tracer>>);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directives(service_name).into());

    let subscriber = tracing_subscriber::registry()
        .with(trace_layer)
        .with(env_filter);

    let result = if config.json {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_target(false)
                    .with_level(true)
                    .with_span_events(FmtSpan::NONE)
                    .with_filter(tracing_subscriber::filter::LevelFilter::INFO),
            )
            .try_init()
    } else {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_span_events(FmtSpan::NONE),
            )
            .try_init()
    };
    result.map_err(|e| ObservabilityError::Logging(e.to_string()))?;

    info!(json = config.json, "Logging initialized");
    Ok(LogHandle {
        trace_layer: handle,
    })
}

fn default_directives(service_name: &str) -> String {
    let crate_target = env!("CARGO_PKG_NAME").replace('-', "_");
    let service_target = service_name.replace('-', "_");
    if crate_target == service_target {
        format!("{crate_target}=info,tower_http=info,sqlx=warn")
    } else {
        format!("{crate_target}=info,{service_target}=info,tower_http=info,sqlx=warn")
    }
}
