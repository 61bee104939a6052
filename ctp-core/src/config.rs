//! Environment-backed application configuration.
//!
//! `.env` files are loaded through `dotenvy` and never overwrite variables
//! that are already set in the process environment.

use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    /// A required variable is missing.
    Missing(&'static str),
    /// A variable exists but could not be parsed.
    Invalid { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing required config variable: {key}"),
            ConfigError::Invalid { key, value } => {
                write!(f, "invalid value for {key}: {value:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Argon2 parameter overrides. Defaults follow the deployment baseline
/// (t=3, m=64 MiB, p=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashingParams {
    pub time_cost: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
}

impl Default for HashingParams {
    fn default() -> Self {
        Self {
            time_cost: 3,
            memory_kib: 65536,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub bind_addr: String,
    /// Signing secret mixed into session token generation.
    pub session_secret: String,
    pub hashing: HashingParams,
    /// Development profiles get verbose error payloads.
    pub debug_mode: bool,
    pub session_ttl: Duration,
    pub refresh_ttl: Duration,
    /// Predefined `ctp_…` tokens for worker service accounts, comma separated
    /// as `slug=token`.
    pub worker_tokens: Vec<(String, String)>,
    /// Bootstrap admin credentials, seeded once at startup when set.
    pub initial_admin: Option<(String, String)>,
}

fn var(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn var_or(key: &'static str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_u32(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl AppConfig {
    /// Load from the process environment, after pulling in `.env`.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Load from the process environment only (no `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let debug_mode = matches!(
            var_or("DEBUG_MODE", "production").to_lowercase().as_str(),
            "dev" | "development" | "local"
        );

        let hashing = HashingParams {
            time_cost: parse_u32("ARGON2_TIME_COST", HashingParams::default().time_cost)?,
            memory_kib: parse_u32("ARGON2_MEMORY_KIB", HashingParams::default().memory_kib)?,
            parallelism: parse_u32("ARGON2_PARALLELISM", HashingParams::default().parallelism)?,
        };

        let worker_tokens = var_or("WORKER_SERVICE_TOKENS", "")
            .split(',')
            .filter_map(|pair| {
                let pair = pair.trim();
                let (slug, token) = pair.split_once('=')?;
                Some((slug.to_string(), token.to_string()))
            })
            .collect();

        let initial_admin = match (std::env::var("ADMIN_USERNAME"), std::env::var("ADMIN_PASSWORD")) {
            (Ok(username), Ok(password)) => Some((username, password)),
            _ => None,
        };

        Ok(Self {
            database_url: var("DATABASE_URL")?,
            redis_url: std::env::var("REDIS_URL").ok(),
            bind_addr: var_or("BIND_ADDR", "0.0.0.0:8000"),
            session_secret: var("SESSION_SECRET")?,
            hashing,
            debug_mode,
            session_ttl: parse_secs("SESSION_TTL_SECS", 3600)?,
            refresh_ttl: parse_secs("REFRESH_TTL_SECS", 30 * 86400)?,
            worker_tokens,
            initial_admin,
        })
    }
}
