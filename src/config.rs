use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub database_path: String,
    pub store_timeout: Duration,
    pub event_buffer_size: usize,
    pub notify_poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "food_dispatch.db".to_string()),
            store_timeout: Duration::from_millis(parse_or_default("STORE_TIMEOUT_MS", 5_000)?),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            notify_poll_interval: Duration::from_millis(parse_or_default(
                "NOTIFY_POLL_INTERVAL_MS",
                3_000,
            )?),
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
