use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use thiserror::Error;
use tracing::debug;

pub const ENV_PRODUCTION: &str = "PRODUCTION";
pub const ENV_DEVELOPMENT: &str = "DEVELOPMENT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Environment(#[from] envy::Error),

    #[error("Invalid integer for {name}: {value}")]
    InvalidInteger { name: &'static str, value: String },

    #[error("Invalid duration for {name}: {value}")]
    InvalidDuration { name: &'static str, value: String },
}

/// Immutable snapshot of the environment-derived settings
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db: DatabaseConfig,
    pub web: WebConfig,
    pub logging: LoggingConfig,
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub jaeger_endpoint: String,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub tls: String,
    pub user: String,
    pub name: String,
    pub host: String,
    pub scheme: String,
    pub password: String,
    pub max_idle_conns: u32,
    pub max_open_conns: u32,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("tls", &self.tls)
            .field("user", &self.user)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("scheme", &self.scheme)
            .field("password", &"<redacted>")
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_open_conns", &self.max_open_conns)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub api_host: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub json: bool,
}

/// Raw view of the environment. Every value is optional; parsing and
/// fallbacks happen afterwards so a malformed value never aborts startup.
#[derive(Debug, Default, Deserialize)]
struct RawEnvironment {
    service_name: Option<String>,
    service_version: Option<String>,
    environment: Option<String>,
    jaeger_endpoint: Option<String>,
    db_tls: Option<String>,
    db_user: Option<String>,
    db_name: Option<String>,
    db_host: Option<String>,
    db_scheme: Option<String>,
    db_password: Option<String>,
    db_max_idle_conn: Option<String>,
    db_max_open_conn: Option<String>,
    server_api_host: Option<String>,
    server_read_timeout: Option<String>,
    server_write_timeout: Option<String>,
    server_idle_timeout: Option<String>,
    server_shutdown_timeout: Option<String>,
    log_json: Option<String>,
}

impl AppConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)));
        Self::from_vars(vars)
    }

    /// Load configuration from an explicit set of variables
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        // Later entries win, the way a repeated `export` would
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let raw = match envy::from_iter::<_, RawEnvironment>(vars) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %ConfigError::from(e), "Falling back to default configuration");
                RawEnvironment::default()
            }
        };

        AppConfig {
            service_name: string_or(raw.service_name, default_service_name),
            service_version: string_or(raw.service_version, default_service_version),
            environment: string_or(raw.environment, default_environment),
            jaeger_endpoint: string_or(raw.jaeger_endpoint, default_jaeger_endpoint),
            db: DatabaseConfig {
                tls: string_or(raw.db_tls, default_db_tls),
                user: string_or(raw.db_user, default_db_user),
                name: string_or(raw.db_name, default_db_name),
                host: string_or(raw.db_host, default_db_host),
                scheme: string_or(raw.db_scheme, default_db_scheme),
                password: string_or(raw.db_password, default_db_password),
                max_idle_conns: integer_or(
                    "DB_MAX_IDLE_CONN",
                    raw.db_max_idle_conn,
                    0,
                    default_max_idle_conns(),
                ),
                max_open_conns: integer_or(
                    "DB_MAX_OPEN_CONN",
                    raw.db_max_open_conn,
                    1,
                    default_max_open_conns(),
                ),
            },
            web: WebConfig {
                api_host: string_or(raw.server_api_host, default_api_host),
                read_timeout: duration_or(
                    "SERVER_READ_TIMEOUT",
                    raw.server_read_timeout,
                    default_read_timeout(),
                ),
                write_timeout: duration_or(
                    "SERVER_WRITE_TIMEOUT",
                    raw.server_write_timeout,
                    default_write_timeout(),
                ),
                idle_timeout: duration_or(
                    "SERVER_IDLE_TIMEOUT",
                    raw.server_idle_timeout,
                    default_idle_timeout(),
                ),
                shutdown_timeout: duration_or(
                    "SERVER_SHUTDOWN_TIMEOUT",
                    raw.server_shutdown_timeout,
                    default_shutdown_timeout(),
                ),
            },
            logging: LoggingConfig {
                json: raw
                    .log_json
                    .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
                    .unwrap_or(true),
            },
        }
    }
}

impl WebConfig {
    /// Address handed to the TCP listener. A bare `:port` binds every interface.
    pub fn bind_address(&self) -> String {
        if self.api_host.starts_with(':') {
            format!("0.0.0.0{}", self.api_host)
        } else {
            self.api_host.clone()
        }
    }
}

fn string_or(value: Option<String>, fallback: fn() -> String) -> String {
    value.filter(|v| !v.is_empty()).unwrap_or_else(fallback)
}

fn integer_or(name: &'static str, value: Option<String>, min: u32, fallback: u32) -> u32 {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return fallback;
    };

    match parse_integer(name, &value, min) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, fallback, "Using default value");
            fallback
        }
    }
}

fn duration_or(name: &'static str, value: Option<String>, fallback: Duration) -> Duration {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return fallback;
    };

    match parse_duration(&value).ok_or_else(|| ConfigError::InvalidDuration {
        name,
        value: value.clone(),
    }) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, fallback = ?fallback, "Using default value");
            fallback
        }
    }
}

fn parse_integer(name: &'static str, value: &str, min: u32) -> Result<u32, ConfigError> {
    value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|parsed| *parsed >= min)
        .ok_or_else(|| ConfigError::InvalidInteger {
            name,
            value: value.to_string(),
        })
}

/// Parse a duration string such as `"300ms"`, `"1.5h"` or `"2h45m"`.
///
/// Accepts the units `ns`, `us` (`µs`), `ms`, `s`, `m` and `h`, with optional
/// decimal fractions. A bare `"0"` is the only unit-less value. Negative
/// durations and totals beyond `u64::MAX` nanoseconds are rejected. Whole
/// parts are exact; fractions are truncated to the nanosecond.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let mut rest = input.strip_prefix('+').unwrap_or(input);
    if rest == "0" {
        return Some(Duration::ZERO);
    }
    if rest.is_empty() {
        return None;
    }

    let mut total_nanos: u128 = 0;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_end);
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return None;
        }

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);
        let nanos_per_unit: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return None,
        };

        let whole_nanos = match whole {
            "" => 0,
            digits => digits.parse::<u128>().ok()?.checked_mul(nanos_per_unit)?,
        };
        total_nanos = total_nanos
            .checked_add(whole_nanos)?
            .checked_add(fraction_nanos(fraction, nanos_per_unit))?;
        rest = next;
    }

    u64::try_from(total_nanos).ok().map(Duration::from_nanos)
}

/// Digits past this many cannot move an hour fraction by a nanosecond.
const MAX_FRACTION_DIGITS: usize = 20;

/// Nanoseconds contributed by the digits after a decimal point.
fn fraction_nanos(digits: &str, nanos_per_unit: u128) -> u128 {
    let digits = &digits[..digits.len().min(MAX_FRACTION_DIGITS)];
    let (value, scale) = digits.bytes().fold((0u128, 1u128), |(value, scale), digit| {
        (value * 10 + u128::from(digit - b'0'), scale * 10)
    });
    value * nanos_per_unit / scale
}

// Default value functions
pub(crate) fn default_service_name() -> String {
    "k8s-demo".to_string()
}

pub(crate) fn default_service_version() -> String {
    "v0.1.0".to_string()
}

pub(crate) fn default_environment() -> String {
    ENV_DEVELOPMENT.to_string()
}

pub(crate) fn default_jaeger_endpoint() -> String {
    "http://jaeger:4318/v1/traces".to_string()
}

pub(crate) fn default_db_tls() -> String {
    "disable".to_string()
}

pub(crate) fn default_db_user() -> String {
    "postgres".to_string()
}

pub(crate) fn default_db_name() -> String {
    "k8s-demo".to_string()
}

pub(crate) fn default_db_host() -> String {
    "localhost".to_string()
}

pub(crate) fn default_db_scheme() -> String {
    "postgres".to_string()
}

pub(crate) fn default_db_password() -> String {
    "password".to_string()
}

pub(crate) fn default_max_idle_conns() -> u32 {
    5
}

pub(crate) fn default_max_open_conns() -> u32 {
    20
}

pub(crate) fn default_api_host() -> String {
    ":8080".to_string()
}

pub(crate) fn default_read_timeout() -> Duration {
    Duration::from_secs(10)
}

pub(crate) fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

pub(crate) fn default_idle_timeout() -> Duration {
    Duration::from_secs(120)
}

pub(crate) fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(20)
}
