use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::{RequestBodyTimeoutLayer, TimeoutLayer},
};

use crate::{
    config::AppConfig,
    database::DataStore,
    observability::{observability_middleware, Metrics},
};

pub mod health;
pub mod metrics;

pub use health::{health_check, HealthState};
pub use metrics::metrics_handler;

/// Build the application router: `/health`, `/metrics` and the middleware
/// stack shared by both.
pub fn create_router(
    config: &AppConfig,
    store: Arc<dyn DataStore>,
    metrics: Arc<Metrics>,
) -> Router {
    let metrics_for_middleware = metrics.clone();

    let health_state = HealthState::new(
        store,
        metrics.clone(),
        config.service_name.clone(),
        config.service_version.clone(),
        config.web.write_timeout,
    );

    Router::new()
        .route("/health", get(health_check))
        .with_state(health_state)
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
        // Add middleware layers (listed inner to outer)
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyTimeoutLayer::new(config.web.read_timeout))
        .layer(TimeoutLayer::new(config.web.write_timeout))
        .layer(middleware::from_fn(move |req, next| {
            observability_middleware(metrics_for_middleware.clone(), req, next)
        }))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
