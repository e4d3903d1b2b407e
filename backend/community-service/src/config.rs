/// Configuration management for Community Service
///
/// Loads configuration from environment variables.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Feed synchronizer settings
    pub sync: SyncSettings,
    /// Book archive settings
    pub resources: ResourcesConfig,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application environment (development, staging, production)
    pub env: String,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,
    /// Max connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Min connections in pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL
    pub url: String,
    /// Pub/Sub channel carrying row change events
    pub change_channel: String,
}

/// Resubscription policy for the change channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    pub resubscribe_max_retries: u32,
    pub resubscribe_initial_backoff_ms: u64,
    pub resubscribe_max_backoff_ms: u64,
}

impl SyncSettings {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.resubscribe_max_retries,
            initial_backoff: Duration::from_millis(self.resubscribe_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.resubscribe_max_backoff_ms),
            ..Default::default()
        }
    }
}

/// Book archive API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub api_base_url: String,
    pub page_size: u32,
}

// Default values
fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let app = AppConfig {
            env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        };

        let database = DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL environment variable not set")?,
            max_connections: env_or("DB_MAX_CONNECTIONS", default_max_connections()),
            min_connections: env_or("DB_MIN_CONNECTIONS", default_min_connections()),
        };

        let redis = RedisConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            change_channel: std::env::var("CHANGE_FEED_CHANNEL")
                .unwrap_or_else(|_| change_feed::ChangePublisher::DEFAULT_CHANNEL.to_string()),
        };

        let sync = SyncSettings {
            resubscribe_max_retries: env_or("SYNC_RESUBSCRIBE_MAX_RETRIES", 5),
            resubscribe_initial_backoff_ms: env_or("SYNC_RESUBSCRIBE_INITIAL_BACKOFF_MS", 200),
            resubscribe_max_backoff_ms: env_or("SYNC_RESUBSCRIBE_MAX_BACKOFF_MS", 10_000),
        };

        let resources = ResourcesConfig {
            api_base_url: std::env::var("RESOURCES_API_BASE_URL")
                .unwrap_or_else(|_| "https://archive.org".to_string()),
            page_size: env_or("RESOURCES_PAGE_SIZE", 12),
        };

        Ok(Config {
            app,
            database,
            redis,
            sync,
            resources,
        })
    }
}
