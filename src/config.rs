use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub listener: ListenerConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// How long (seconds) a worker blocks waiting for a server notification
    /// before emitting a heartbeat and polling again.
    pub poll_interval_seconds: u64,

    /// Name of a registered envelope filter to apply on both the live and
    /// replay paths. Read from `PGPUBSUB_LISTENER_FILTER`. When unset, every
    /// envelope is accepted.
    pub filter: Option<String>,

    /// Whether the payload's top-level `context` object is surfaced to
    /// callbacks. Read from `PGPUBSUB_PASS_CONTEXT_TO_LISTENERS`.
    pub pass_context_to_listeners: bool,

    /// Whether the payload's top-level `extras` object is surfaced to
    /// callbacks. Read from `PGPUBSUB_PASS_EXTRAS_TO_LISTENERS`.
    pub pass_extras_to_listeners: bool,

    /// Minimum acceptable `db_version` on trigger payloads. Envelopes whose
    /// stored migration identifier sorts below this value are skipped and
    /// their rows left for a future deployment.
    pub min_db_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// How often (seconds) queue depth and lag gauges are refreshed.
    pub interval_seconds: u64,
    /// Prefix prepended to every published metric name.
    pub prefix: String,
}

/// Parse the loose boolean convention used across our env vars.
/// Unrecognized values fall back to `default`.
fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => parse_bool(&v).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .map_err(|_| ConfigError::MissingEnv("DATABASE_URL".to_string()))?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            listener: ListenerConfig {
                poll_interval_seconds: env::var("PGPUBSUB_POLL_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .map_err(|_| {
                        ConfigError::InvalidValue("PGPUBSUB_POLL_INTERVAL_SECONDS".to_string())
                    })?,
                filter: env::var("PGPUBSUB_LISTENER_FILTER").ok(),
                pass_context_to_listeners: env_bool("PGPUBSUB_PASS_CONTEXT_TO_LISTENERS", false),
                pass_extras_to_listeners: env_bool("PGPUBSUB_PASS_EXTRAS_TO_LISTENERS", false),
                min_db_version: env::var("PGPUBSUB_MIN_DB_VERSION").ok(),
            },
            metrics: MetricsConfig {
                interval_seconds: env::var("PGPUBSUB_METRICS_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
                prefix: env::var("PGPUBSUB_METRICS_PREFIX")
                    .unwrap_or_else(|_| "pgpubsub".to_string()),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/pgpubsub".to_string(),
                max_connections: 5,
            },
            listener: ListenerConfig {
                poll_interval_seconds: 5,
                filter: None,
                pass_context_to_listeners: false,
                pass_extras_to_listeners: false,
                min_db_version: None,
            },
            metrics: MetricsConfig {
                interval_seconds: 30,
                prefix: "pgpubsub".to_string(),
            },
        }
    }
}
