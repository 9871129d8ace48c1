pub mod config;
pub mod database;
pub mod handlers;
pub mod observability;
pub mod response;
pub mod server;

pub use config::{AppConfig, ConfigError};
pub use database::{check_status, DataStore, PoolStats, PostgresStore};
pub use observability::{init_logging, LogHandle, Metrics};
pub use server::{LifecycleState, Server, ServerError};
