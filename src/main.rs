use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info, warn};

use k8s_demo::{init_logging, AppConfig, LogHandle, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    let config = Arc::new(AppConfig::from_env());
    let logs = init_logging(&config.logging, &config.service_name)
        .context("Failed to initialize logging")?;

    if let Err(e) = dotenv {
        if !e.not_found() {
            warn!(error = %e, "Failed to load .env file");
        }
    }

    info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = %config.environment,
        pid = std::process::id(),
        "Starting service"
    );

    if let Err(e) = run(config, &logs).await {
        error!(error = %e, "Service terminated with an error");
        return Err(e);
    }

    info!("Service stopped");
    Ok(())
}

async fn run(config: Arc<AppConfig>, logs: &LogHandle) -> anyhow::Result<()> {
    let server = Arc::new(
        Server::new(config, logs)
            .await
            .context("Failed to start server")?,
    );

    let shutdown_signal = shutdown_signal()?;

    server
        .run_until(shutdown_signal)
        .await
        .context("Server stopped with an error")
}

/// Register SIGTERM and SIGINT handlers and return a future that resolves
/// with the name of the first signal received.
#[cfg(unix)]
fn shutdown_signal() -> anyhow::Result<impl std::future::Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> anyhow::Result<impl std::future::Future<Output = &'static str>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        "SIGINT"
    })
}
