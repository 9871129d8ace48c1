use async_trait::async_trait;
use serde::Serialize;
use sqlx::{
    postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode},
    Connection,
};
use std::{
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::DatabaseConfig;

pub mod status;

pub use status::{
    backoff_for_attempt, check_status, StatusCheckError, BACKOFF_STEP,
    DEFAULT_STATUS_CHECK_TIMEOUT,
};

const DEFAULT_PORT: u16 = 5432;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

/// Data-store errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Unsupported database scheme: {scheme}")]
    InvalidScheme { scheme: String },

    #[error("Invalid database host: {host}")]
    InvalidHost { host: String },

    #[error("Invalid TLS mode {mode}: {source}")]
    InvalidTlsMode {
        mode: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Snapshot of the connection pool reported by the health endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub open: u32,
    pub idle: u32,
    pub in_use: u32,
    pub max_open: u32,
    pub wait_count: u64,
}

/// Operations the service needs from its data store
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Lightweight liveness probe
    async fn ping(&self) -> Result<(), DatabaseError>;

    /// Run `SELECT TRUE` and return the scanned value
    async fn select_true(&self) -> Result<bool, DatabaseError>;

    fn stats(&self) -> PoolStats;

    /// Close every connection and refuse new checkouts
    async fn close(&self);
}

/// PostgreSQL data store backed by an sqlx connection pool.
///
/// The pool is created lazily: opening validates the settings but no
/// connection is made until the first probe.
pub struct PostgresStore {
    pool: PgPool,
    max_open: u32,
    wait_count: AtomicU64,
}

impl PostgresStore {
    #[instrument(name = "database_open", skip(config), fields(host = %config.host, database = %config.name))]
    pub fn open(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let options = connect_options(config)?;
        let max_open = config.max_open_conns.max(1);

        let pool = PgPoolOptions::new()
            .max_connections(max_open)
            .min_connections(config.max_idle_conns.min(max_open))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(options);

        info!(
            max_open_conns = max_open,
            max_idle_conns = config.max_idle_conns,
            tls = %config.tls,
            "Database pool created"
        );

        Ok(Self {
            pool,
            max_open,
            wait_count: AtomicU64::new(0),
        })
    }

    /// A checkout has to wait when nothing is idle and the pool is full
    fn note_checkout(&self) {
        if self.pool.num_idle() == 0 && self.pool.size() >= self.max_open {
            self.wait_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl DataStore for PostgresStore {
    async fn ping(&self) -> Result<(), DatabaseError> {
        self.note_checkout();
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    async fn select_true(&self) -> Result<bool, DatabaseError> {
        self.note_checkout();
        let value = sqlx::query_scalar::<_, bool>("SELECT TRUE")
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }

    fn stats(&self) -> PoolStats {
        let open = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX).min(open);
        PoolStats {
            open,
            idle,
            in_use: open - idle,
            max_open: self.max_open,
            wait_count: self.wait_count.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) {
        info!("Closing database pool");
        self.pool.close().await;
        info!("Database pool closed");
    }
}

fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions, DatabaseError> {
    if !matches!(config.scheme.as_str(), "postgres" | "postgresql") {
        return Err(DatabaseError::InvalidScheme {
            scheme: config.scheme.clone(),
        });
    }

    let ssl_mode =
        PgSslMode::from_str(&config.tls).map_err(|source| DatabaseError::InvalidTlsMode {
            mode: config.tls.clone(),
            source,
        })?;

    let (host, port) = split_host_port(&config.host)?;

    Ok(PgConnectOptions::new()
        .host(&host)
        .port(port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.name)
        .ssl_mode(ssl_mode))
}

/// Split `DB_HOST` into host and port. Accepts `host`, `host:port`,
/// `[v6]` and `[v6]:port`.
pub(crate) fn split_host_port(value: &str) -> Result<(String, u16), DatabaseError> {
    let invalid = || DatabaseError::InvalidHost {
        host: value.to_string(),
    };

    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail {
            "" => DEFAULT_PORT,
            tail => tail
                .strip_prefix(':')
                .and_then(|port| port.parse().ok())
                .ok_or_else(invalid)?,
        };
        return Ok((host.to_string(), port));
    }

    match value.split_once(':') {
        Some((host, port)) if !port.contains(':') => {
            let port = port.parse().map_err(|_| invalid())?;
            if host.is_empty() {
                return Err(invalid());
            }
            Ok((host.to_string(), port))
        }
        // A bare IPv6 address without brackets carries no port
        Some(_) => Ok((value.to_string(), DEFAULT_PORT)),
        None if value.is_empty() => Err(invalid()),
        None => Ok((value.to_string(), DEFAULT_PORT)),
    }
}
