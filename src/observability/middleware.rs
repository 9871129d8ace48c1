use axum::{
    extract::{MatchedPath, Request},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use opentelemetry::{global, propagation::Extractor, trace::TraceContextExt};
use std::{sync::Arc, time::Instant};
use tracing::{error, info, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::Metrics;

/// Metrics label for requests that matched no route, so arbitrary paths
/// never mint new series.
pub const UNMATCHED_ENDPOINT: &str = "unmatched";

/// Holds one slot of the `active_requests` gauge until dropped, including
/// when the request future is cancelled mid-flight.
struct ActiveRequestGuard {
    metrics: Arc<Metrics>,
}

impl ActiveRequestGuard {
    fn new(metrics: Arc<Metrics>) -> Self {
        metrics.increment_active_requests();
        Self { metrics }
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.metrics.decrement_active_requests();
    }
}

/// Reads propagation headers from an incoming request
struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|key| key.as_str()).collect()
    }
}

/// Middleware for request tracing and metrics collection.
///
/// Continues the caller's trace when `traceparent`/`baggage` headers are
/// present, opens a server span named after the matched route, keeps the
/// `active_requests` gauge current and records the request counters.
pub async fn observability_middleware(
    metrics: Arc<Metrics>,
    request: Request,
    next: Next,
) -> Response {
    let start_time = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched_path| matched_path.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ENDPOINT.to_string());

    let parent_context = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(request.headers()))
    });

    let span_name = format!("{} {}", method, endpoint);
    let span = tracing::info_span!(
        "http_request",
        otel.name = %span_name,
        otel.kind = "server",
        otel.status_code = tracing::field::Empty,
        http.method = %method,
        http.route = %endpoint,
        http.url = %request.uri(),
        http.user_agent = %user_agent,
        http.status_code = tracing::field::Empty,
        request_id = %request_id,
    );
    span.set_parent(parent_context);

    async move {
        let _active = ActiveRequestGuard::new(metrics.clone());

        let trace_id = tracing::Span::current()
            .context()
            .span()
            .span_context()
            .trace_id()
            .to_string();

        info!(trace_id = %trace_id, method = %method, path = %path, request_id = %request_id, "Processing request");

        let response = next.run(request).await;

        let duration = start_time.elapsed();
        let status_code = response.status().as_u16();

        let current_span = tracing::Span::current();
        current_span.record("http.status_code", status_code);
        current_span.record(
            "otel.status_code",
            if status_code >= 500 { "ERROR" } else { "OK" },
        );

        metrics.record_http_request(&method, &endpoint, status_code, duration.as_secs_f64());

        if status_code >= 500 {
            error!(
                trace_id = %trace_id,
                method = %method,
                path = %path,
                status_code = status_code,
                duration_ms = duration.as_millis(),
                "Request completed with error"
            );
        } else {
            info!(
                trace_id = %trace_id,
                method = %method,
                path = %path,
                status_code = status_code,
                duration_ms = duration.as_millis(),
                "Request completed"
            );
        }

        response
    }
    .instrument(span)
    .await
}
