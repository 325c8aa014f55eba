//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub delivery: DeliveryConfig,
    pub actor_cache: ActorCacheConfig,
    pub instance: InstanceConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Delivery engine tuning (C8)
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Upper bound on concurrent in-flight deliveries
    pub max_concurrent_deliveries: usize,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
    /// Number of requeue attempts before giving up on a delivery
    pub max_retries: u32,
    /// Initial backoff before the first requeue attempt
    pub initial_backoff_secs: u64,
    /// Ceiling on the exponential backoff
    pub max_backoff_secs: u64,
}

/// Actor resolver cache tuning (C3)
#[derive(Debug, Clone, Deserialize)]
pub struct ActorCacheConfig {
    /// Time-to-live for a cached remote actor document
    pub ttl_secs: u64,
}

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub title: String,
    pub description: String,
    pub contact_email: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDIBOX__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("delivery.max_concurrent_deliveries", 10)?
            .set_default("delivery.request_timeout_secs", 30)?
            .set_default("delivery.max_retries", 5)?
            .set_default("delivery.initial_backoff_secs", 60)?
            .set_default("delivery.max_backoff_secs", 21600)?
            .set_default("actor_cache.ttl_secs", 3600)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDIBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))
    }
}
