//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub openai_api_key: Option<String>,
    pub analysis_model: String,
    pub oracle_timeout_secs: u64,
    pub video_base_url: String,
    pub room_ttl_minutes: u32,
    pub session_fee_tokens: i64,
    pub reputation_increment: i32,
    pub session_max_age_minutes: i64,
    pub sweep_interval_secs: u64,
    pub monitor_rate_limit: u32,
    pub monitor_rate_window_secs: u64,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Load Server and Database Settings ---
        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load API Keys (as optional) ---
        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();

        // --- Load Adapter-specific Settings ---
        let analysis_model =
            std::env::var("ANALYSIS_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let oracle_timeout_secs = parse_var("ORACLE_TIMEOUT_SECS", 20)?;
        let video_base_url = std::env::var("VIDEO_BASE_URL")
            .unwrap_or_else(|_| "https://meet.jit.si".to_string());
        let room_ttl_minutes = parse_var("ROOM_TTL_MINUTES", 120)?;

        // --- Load Engine Settings ---
        let session_fee_tokens = parse_var("SESSION_FEE_TOKENS", 10)?;
        let reputation_increment = parse_var("REPUTATION_INCREMENT", 1)?;
        let session_max_age_minutes = parse_var("SESSION_MAX_AGE_MINUTES", 240)?;
        let sweep_interval_secs = parse_var("SWEEP_INTERVAL_SECS", 300)?;
        let monitor_rate_limit = parse_var("MONITOR_RATE_LIMIT", 4)?;
        let monitor_rate_window_secs = parse_var("MONITOR_RATE_WINDOW_SECS", 60)?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            openai_api_key,
            analysis_model,
            oracle_timeout_secs,
            video_base_url,
            room_ttl_minutes,
            session_fee_tokens,
            reputation_increment,
            session_max_age_minutes,
            sweep_interval_secs,
            monitor_rate_limit,
            monitor_rate_window_secs,
        })
    }
}

/// Parses an optional numeric environment variable, falling back to a default.
fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
