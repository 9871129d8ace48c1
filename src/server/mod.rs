use axum::Router;
use std::{fmt, future::Future, io, net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex},
    time::{timeout_at, Instant},
};
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    config::AppConfig,
    database::{check_status, DataStore, DatabaseError, PostgresStore, StatusCheckError},
    handlers::create_router,
    observability::{
        init_tracing, LogHandle, Metrics, MetricsError, TracingConfig, TracingShutdown,
    },
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to initialize metrics: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Failed to open database: {0}")]
    DataStoreOpen(#[source] DatabaseError),

    #[error("Database connectivity check failed: {0}")]
    DataStoreConnectivity(#[source] StatusCheckError),

    #[error("Failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] io::Error),

    #[error("Server cannot start in state {0}")]
    NotStartable(LifecycleState),

    #[error("Listener did not drain within {0:?}")]
    ShutdownTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Serving,
    ShuttingDown,
    Stopped,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Serving => "serving",
            LifecycleState::ShuttingDown => "shutting down",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Owns the HTTP listener, the data store and the tracing shutdown hook.
///
/// Construction runs the whole startup sequence. `start` serves until
/// `shutdown` is called, which tears resources down in a fixed order:
/// listener, then data store, then tracing.
pub struct Server {
    config: Arc<AppConfig>,
    store: Arc<dyn DataStore>,
    router: Router,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    tracing: Mutex<Option<TracingShutdown>>,
    state: watch::Sender<LifecycleState>,
    stop: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

impl Server {
    /// Bring up tracing, metrics and the PostgreSQL pool, verify the
    /// database answers, then bind the HTTP listener.
    pub async fn new(config: Arc<AppConfig>, logs: &LogHandle) -> Result<Self, ServerError> {
        let telemetry = bootstrap_tracing(&config, logs);

        let metrics = match Metrics::new() {
            Ok(metrics) => Arc::new(metrics),
            Err(e) => {
                flush_tracing(telemetry, config.web.shutdown_timeout).await;
                return Err(e.into());
            }
        };

        let store: Arc<dyn DataStore> = match PostgresStore::open(&config.db) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to open database");
                flush_tracing(telemetry, config.web.shutdown_timeout).await;
                return Err(ServerError::DataStoreOpen(e));
            }
        };

        Self::assemble(config, telemetry, metrics, store).await
    }

    /// Build a server around an already opened data store, without tracing.
    /// The store is closed if construction fails.
    pub async fn with_store(
        config: Arc<AppConfig>,
        store: Arc<dyn DataStore>,
    ) -> Result<Self, ServerError> {
        let metrics = match Metrics::new() {
            Ok(metrics) => Arc::new(metrics),
            Err(e) => {
                store.close().await;
                return Err(e.into());
            }
        };

        Self::assemble(config, TracingShutdown::noop(), metrics, store).await
    }

    async fn assemble(
        config: Arc<AppConfig>,
        telemetry: TracingShutdown,
        metrics: Arc<Metrics>,
        store: Arc<dyn DataStore>,
    ) -> Result<Self, ServerError> {
        let checked = check_status(store.as_ref(), None)
            .instrument(tracing::info_span!("startup_check"))
            .await;

        if let Err(e) = checked {
            error!(error = %e, "Database connectivity check failed");
            abandon_startup(store.as_ref(), telemetry, config.web.shutdown_timeout).await;
            return Err(ServerError::DataStoreConnectivity(e));
        }
        info!("Database connection verified");

        let router = create_router(&config, store.clone(), metrics);

        let address = config.web.bind_address();
        let bound = match TcpListener::bind(&address).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                error!(address = %address, error = %source, "Failed to bind listener");
                abandon_startup(store.as_ref(), telemetry, config.web.shutdown_timeout).await;
                return Err(ServerError::Listen { address, source });
            }
        };

        let (state, _) = watch::channel(LifecycleState::Starting);
        let (stop, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            router,
            local_addr,
            listener: Mutex::new(Some(listener)),
            tracing: Mutex::new(Some(telemetry)),
            state,
            stop,
            closed,
        })
    }

    /// Serve until `shutdown` closes the listener. A shutdown-triggered
    /// close returns `Ok(())`.
    pub async fn start(&self) -> Result<(), ServerError> {
        let Some(listener) = self.listener.lock().await.take() else {
            return Err(ServerError::NotStartable(self.state()));
        };

        self.state.send_replace(LifecycleState::Serving);
        info!(
            address = %self.local_addr,
            service = %self.config.service_name,
            version = %self.config.service_version,
            environment = %self.config.environment,
            read_timeout = ?self.config.web.read_timeout,
            write_timeout = ?self.config.web.write_timeout,
            idle_timeout = ?self.config.web.idle_timeout,
            "Server listening"
        );

        let mut stop = self.stop.subscribe();
        let result = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            })
            .await;

        self.closed.send_replace(true);

        match result {
            Ok(()) => {
                info!("Server stopped accepting connections");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Server error");
                self.state.send_replace(LifecycleState::Failed);
                Err(ServerError::Serve(e))
            }
        }
    }

    /// Stop the listener, close the data store and flush tracing, in that
    /// order, within the configured shutdown timeout. Every step runs; only
    /// a listener that fails to drain in time is reported. Later calls are
    /// no-ops.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let first_call = self.state.send_if_modified(|state| match *state {
            LifecycleState::ShuttingDown | LifecycleState::Stopped => false,
            _ => {
                *state = LifecycleState::ShuttingDown;
                true
            }
        });
        if !first_call {
            warn!("Shutdown already in progress or completed");
            return Ok(());
        }

        let timeout = self.config.web.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        info!(timeout = ?timeout, "Shutting down server");

        let listener_result = self.stop_listener(deadline, timeout).await;

        match timeout_at(deadline, self.store.close()).await {
            Ok(()) => info!("Database closed"),
            Err(_) => warn!("Timed out closing database"),
        }

        let telemetry = self.tracing.lock().await.take();
        if let Some(telemetry) = telemetry {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = telemetry.shutdown(remaining).await {
                warn!(error = %e, "Failed to flush tracing");
            }
        }

        self.state.send_replace(LifecycleState::Stopped);
        info!("Server shutdown complete");
        listener_result
    }

    async fn stop_listener(&self, deadline: Instant, timeout: Duration) -> Result<(), ServerError> {
        self.stop.send_replace(true);

        if self.listener.lock().await.take().is_some() {
            debug!("Listener was never started");
            return Ok(());
        }

        let mut closed = self.closed.subscribe();
        let drained = timeout_at(deadline, async move {
            let _ = closed.wait_for(|closed| *closed).await;
        })
        .await;

        match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                error!(timeout = ?timeout, "Listener did not drain before the deadline");
                Err(ServerError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Serve until `signal` resolves or serving fails, then shut down.
    ///
    /// A serving error takes precedence over the shutdown result. When the
    /// listener misses the shutdown deadline the serving task is aborted
    /// instead of awaited.
    pub async fn run_until<F>(self: Arc<Self>, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = &'static str>,
    {
        let (server_errors, mut server_error) = mpsc::channel::<ServerError>(1);
        let serving = {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.start().await {
                    let _ = server_errors.send(e).await;
                }
            })
        };

        let serve_error = tokio::select! {
            Some(e) = server_error.recv() => {
                error!(error = %e, "Server error");
                Some(e)
            }
            signal = signal => {
                info!(signal, "Shutdown signal received");
                None
            }
        };

        let shutdown = self.shutdown().await;
        if shutdown.is_err() {
            serving.abort();
        }

        match serve_error {
            Some(e) => Err(e),
            None => shutdown,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }
}

/// Start tracing; a failure leaves the service running without it.
fn bootstrap_tracing(config: &AppConfig, logs: &LogHandle) -> TracingShutdown {
    match init_tracing(&TracingConfig::from(config)) {
        Ok(install) => {
            if let Err(e) = logs.attach_tracer(install.tracer) {
                warn!(error = %e, "Failed to attach tracer to the log subscriber");
            }
            install.shutdown
        }
        Err(e) => {
            warn!(error = %e, "Failed to initialize tracing, continuing without it");
            TracingShutdown::noop()
        }
    }
}

async fn flush_tracing(telemetry: TracingShutdown, timeout: Duration) {
    if let Err(e) = telemetry.shutdown(timeout).await {
        warn!(error = %e, "Failed to flush tracing");
    }
}

async fn abandon_startup(store: &dyn DataStore, telemetry: TracingShutdown, timeout: Duration) {
    if tokio::time::timeout(timeout, store.close()).await.is_err() {
        warn!("Timed out closing database");
    }
    flush_tracing(telemetry, timeout).await;
}
