use axum::{
    extract::State,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{field::Empty, instrument, Instrument, Span};

use crate::{
    database::{check_status, DataStore, PoolStats, DEFAULT_STATUS_CHECK_TIMEOUT},
    error_with_trace, info_with_trace,
    observability::Metrics,
    response::{ErrorResponse, SuccessResponse},
};

/// State for the health handler
#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn DataStore>,
    pub metrics: Arc<Metrics>,
    pub service: String,
    pub version: String,
    pub check_timeout: Duration,
}

impl HealthState {
    pub fn new(
        store: Arc<dyn DataStore>,
        metrics: Arc<Metrics>,
        service: String,
        version: String,
        write_timeout: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            service,
            version,
            check_timeout: health_check_timeout(write_timeout),
        }
    }
}

/// Budget for the database check inside one request. It finishes before
/// the write timeout fires so a down database is reported as a 500, not a
/// request timeout.
pub fn health_check_timeout(write_timeout: Duration) -> Duration {
    write_timeout
        .saturating_sub(write_timeout / 4)
        .min(DEFAULT_STATUS_CHECK_TIMEOUT)
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub uptime_check: &'static str,
    pub status: &'static str,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub database: DatabaseCheck,
}

#[derive(Debug, Serialize)]
pub struct DatabaseCheck {
    pub status: &'static str,
    pub duration_ms: f64,
    pub connections: PoolStats,
}

/// Health check endpoint handler.
///
/// The `health_check` span carries the verdict and pool figures; the nested
/// `health_check_database` span carries the outcome of the status check.
#[instrument(
    name = "health_check",
    skip(state),
    fields(
        health_check.passed = Empty,
        health_check.db_duration_seconds = Empty,
        db.connections.open = Empty,
        db.connections.idle = Empty,
        db.connections.in_use = Empty,
        otel.status_code = Empty,
        error = Empty,
    )
)]
pub async fn health_check(State(state): State<HealthState>) -> Response {
    info_with_trace!("Health check requested");

    let db_span = tracing::info_span!(
        "health_check_database",
        db.operation = "ping",
        db.purpose = "health_check",
        db.healthy = Empty,
        db.duration_seconds = Empty,
        otel.status_code = Empty,
        error = Empty,
    );

    let db_start = Instant::now();
    let result = check_status(state.store.as_ref(), Some(db_start + state.check_timeout))
        .instrument(db_span.clone())
        .await;

    let db_duration = db_start.elapsed();
    let duration_ms = db_duration.as_secs_f64() * 1000.0;
    state
        .metrics
        .record_database_query("health_check", db_duration.as_secs_f64());

    let span = Span::current();
    db_span.record("db.healthy", result.is_ok());
    db_span.record("db.duration_seconds", db_duration.as_secs_f64());
    span.record("health_check.passed", result.is_ok());
    span.record("health_check.db_duration_seconds", db_duration.as_secs_f64());

    if let Err(e) = result {
        for span in [&db_span, &span] {
            span.record("otel.status_code", "ERROR");
            span.record("error", tracing::field::display(&e));
        }
        error_with_trace!(error = %e, duration_ms, "Database health check failed");

        return ErrorResponse::internal(
            "Database connectivity issue",
            json!({
                "component": "database",
                "timestamp": Utc::now(),
                "duration_ms": duration_ms,
            }),
        )
        .into_response();
    }

    let stats = state.store.stats();
    state.metrics.set_active_connections(f64::from(stats.open));
    span.record("db.connections.open", stats.open);
    span.record("db.connections.idle", stats.idle);
    span.record("db.connections.in_use", stats.in_use);

    info_with_trace!(
        db_duration_ms = duration_ms,
        db_connections_open = stats.open,
        db_connections_idle = stats.idle,
        db_connections_in_use = stats.in_use,
        "Health check completed successfully"
    );

    SuccessResponse::ok(
        "Service healthy",
        HealthReport {
            uptime_check: "passed",
            status: "healthy",
            service: state.service.clone(),
            version: state.version.clone(),
            timestamp: Utc::now(),
            checks: HealthChecks {
                database: DatabaseCheck {
                    status: "connected",
                    duration_ms,
                    connections: stats,
                },
            },
        },
    )
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::mocks::{connection_refused, MockStore};
    use axum::{body::Body, http::Request, http::StatusCode, routing::get, Router};
    use serde_json::Value;
    use std::{
        fmt,
        sync::{Arc, Mutex},
    };
    use tower::ServiceExt;
    use tracing::{
        field::{Field, Visit},
        span,
    };
    use tracing_subscriber::{layer::Context, prelude::*, Layer};

    /// Collects `(span name, field, value)` for every value recorded on a
    /// span after it was created
    #[derive(Clone, Default)]
    struct RecordedFields(Arc<Mutex<Vec<(String, String, String)>>>);

    impl RecordedFields {
        fn get(&self, span_name: &str, field: &str) -> Option<String> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .find(|(name, key, _)| name == span_name && key == field)
                .map(|(_, _, value)| value.clone())
        }
    }

    impl<S> Layer<S> for RecordedFields
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
            let Some(span) = ctx.span(id) else { return };
            values.record(&mut FieldVisitor {
                span_name: span.name(),
                out: &self.0,
            });
        }
    }

    struct FieldVisitor<'a> {
        span_name: &'static str,
        out: &'a Mutex<Vec<(String, String, String)>>,
    }

    impl Visit for FieldVisitor<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.out.lock().unwrap().push((
                self.span_name.to_string(),
                field.name().to_string(),
                format!("{value:?}"),
            ));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.record_debug(field, &format_args!("{value}"));
        }
    }

    fn app(store: MockStore, metrics: Arc<Metrics>) -> Router {
        let state = HealthState::new(
            Arc::new(store),
            metrics,
            "k8s-demo".to_string(),
            "v0.1.0".to_string(),
            Duration::from_secs(10),
        );
        Router::new()
            .route("/health", get(health_check))
            .with_state(state)
    }

    async fn get_health(app: Router) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn test_health_check_timeout() {
        assert_eq!(
            health_check_timeout(Duration::from_secs(10)),
            Duration::from_millis(7500)
        );
        assert_eq!(
            health_check_timeout(Duration::from_secs(60)),
            DEFAULT_STATUS_CHECK_TIMEOUT
        );
        assert_eq!(health_check_timeout(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_health_check_healthy() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let mut store = MockStore::new();
        store.expect_ping().returning(|| Ok(()));
        store.expect_select_true().returning(|| Ok(true));
        store.expect_stats().returning(|| PoolStats {
            open: 2,
            idle: 1,
            in_use: 1,
            max_open: 20,
            wait_count: 0,
        });

        let (status, body) = get_health(app(store, metrics.clone())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Service healthy");
        assert_eq!(body["data"]["status"], "healthy");
        assert_eq!(body["data"]["uptime_check"], "passed");
        assert_eq!(body["data"]["service"], "k8s-demo");
        assert_eq!(body["data"]["version"], "v0.1.0");
        assert_eq!(body["data"]["checks"]["database"]["status"], "connected");
        assert_eq!(
            body["data"]["checks"]["database"]["connections"],
            serde_json::json!({
                "open": 2,
                "idle": 1,
                "in_use": 1,
                "max_open": 20,
                "wait_count": 0
            })
        );

        assert_eq!(metrics.database_connections_active.get(), 2.0);
        assert!(metrics
            .encode()
            .unwrap()
            .contains("query_type=\"health_check\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_database_down() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let mut store = MockStore::new();
        store.expect_ping().returning(|| Err(connection_refused()));
        store.expect_select_true().never();
        store.expect_stats().never();

        let (status, body) = get_health(app(store, metrics.clone())).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], 500);
        assert_eq!(body["errorCode"], "StatusInternalServerError");
        assert_eq!(body["message"], "Database connectivity issue");
        assert_eq!(body["details"]["component"], "database");
        assert!(body["details"]["timestamp"].is_string());
        assert_eq!(body["details"]["duration_ms"], 7500.0);

        assert!(metrics
            .encode()
            .unwrap()
            .contains("query_type=\"health_check\""));
    }

    #[tokio::test]
    async fn test_health_check_spans_record_outcome() {
        let recorded = RecordedFields::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(recorded.clone()));

        let mut store = MockStore::new();
        store.expect_ping().returning(|| Ok(()));
        store.expect_select_true().returning(|| Ok(true));
        store.expect_stats().returning(|| PoolStats {
            open: 3,
            idle: 2,
            in_use: 1,
            max_open: 20,
            wait_count: 0,
        });

        let (status, _) = get_health(app(store, Arc::new(Metrics::new().unwrap()))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(recorded.get("health_check", "health_check.passed").as_deref(), Some("true"));
        assert_eq!(recorded.get("health_check", "db.connections.open").as_deref(), Some("3"));
        assert_eq!(recorded.get("health_check", "db.connections.idle").as_deref(), Some("2"));
        assert_eq!(recorded.get("health_check", "db.connections.in_use").as_deref(), Some("1"));
        assert!(recorded.get("health_check", "health_check.db_duration_seconds").is_some());
        assert_eq!(recorded.get("health_check_database", "db.healthy").as_deref(), Some("true"));
        assert!(recorded.get("health_check_database", "db.duration_seconds").is_some());
        assert_eq!(recorded.get("health_check_database", "error"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_spans_record_failure() {
        let recorded = RecordedFields::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(recorded.clone()));

        let mut store = MockStore::new();
        store.expect_ping().returning(|| Err(connection_refused()));
        store.expect_stats().never();

        let (status, _) = get_health(app(store, Arc::new(Metrics::new().unwrap()))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(recorded.get("health_check", "health_check.passed").as_deref(), Some("false"));
        assert_eq!(recorded.get("health_check", "otel.status_code").as_deref(), Some("ERROR"));
        assert_eq!(recorded.get("health_check_database", "db.healthy").as_deref(), Some("false"));
        assert_eq!(
            recorded.get("health_check_database", "otel.status_code").as_deref(),
            Some("ERROR")
        );
        assert!(recorded.get("health_check_database", "error").is_some());
        assert_eq!(recorded.get("health_check", "db.connections.open"), None);
    }
}
