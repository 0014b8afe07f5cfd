use std::env;
use std::path::PathBuf;

use chrono::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub store_backend: StoreBackend,
    pub database_path: PathBuf,
    pub event_buffer_size: usize,
    pub timeout_sweep_interval_secs: u64,
    pub preorder_sweep_interval_secs: u64,
    pub dispatch: DispatchSettings,
}

/// Timing knobs of the dispatch engine.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// How long a driver has to answer an offer. Also the age after which a
    /// never-offered queue entry counts as stale.
    pub accept_window: Duration,
    pub pending_dispatch_grace: Duration,
    pub preorder_reminder_lead: Duration,
    pub location_request_ttl: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            accept_window: Duration::seconds(60),
            pending_dispatch_grace: Duration::minutes(15),
            preorder_reminder_lead: Duration::minutes(30),
            location_request_ttl: Duration::minutes(5),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let store_backend = match env::var("STORE_BACKEND").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            Ok("sqlite") | Err(_) => StoreBackend::Sqlite,
            Ok(other) => {
                return Err(AppError::Internal(format!(
                    "invalid STORE_BACKEND: {other}, expected sqlite or memory"
                )));
            }
        };

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            store_backend,
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dispatch.db")),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            timeout_sweep_interval_secs: parse_or_default("TIMEOUT_SWEEP_INTERVAL_SECS", 5)?,
            preorder_sweep_interval_secs: parse_or_default("PREORDER_SWEEP_INTERVAL_SECS", 60)?,
            dispatch: DispatchSettings {
                accept_window: Duration::seconds(parse_or_default(
                    "DRIVER_ACCEPT_TIMEOUT_SECS",
                    60,
                )?),
                pending_dispatch_grace: Duration::seconds(parse_or_default(
                    "PENDING_DISPATCH_GRACE_SECS",
                    900,
                )?),
                preorder_reminder_lead: Duration::seconds(parse_or_default(
                    "PREORDER_REMINDER_LEAD_SECS",
                    1800,
                )?),
                location_request_ttl: Duration::seconds(parse_or_default(
                    "LOCATION_REQUEST_TTL_SECS",
                    300,
                )?),
            },
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
