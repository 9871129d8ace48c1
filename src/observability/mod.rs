pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tracing;

pub use logging::{init_logging, LogHandle};
pub use metrics::{Metrics, MetricsError};
pub use middleware::observability_middleware;
pub use self::tracing::{
    get_current_trace_id, init_tracing, ObservabilityError, TracingConfig, TracingInstall,
    TracingShutdown,
};
