//! Worker configuration loaded from environment variables

use db_pool::{parse_env_or, DbConfig};
use job_queue::RetryPolicy;
use std::str::FromStr;
use std::time::Duration;

use crate::db::statements::MAX_ROWS_PER_STATEMENT;
use crate::error::ConfigError;
use crate::jobs::DEFAULT_CHUNK_SIZE;
use crate::SERVICE_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT` (`text` or `json`), defaulting to text.
    ///
    /// Read on its own so tracing is up before the rest of the config loads.
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub block: Duration,
    pub lease_timeout: Duration,
}

impl QueueSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: self.backoff_base,
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub invalidation_enabled: bool,
    pub broadcast_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: String,
    pub database: DbConfig,
    pub redis_url: String,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub cache: CacheSettings,
    pub metrics_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database = DbConfig::from_env(SERVICE_NAME).map_err(ConfigError::Database)?;

        let concurrency: usize = env_or("WORKER_CONCURRENCY", 1)?;
        if concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "0", "must be at least 1"));
        }

        let chunk_size: usize = env_or("BULK_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        if chunk_size == 0 || chunk_size > MAX_ROWS_PER_STATEMENT {
            return Err(invalid(
                "BULK_CHUNK_SIZE",
                &chunk_size.to_string(),
                &format!("must be between 1 and {}", MAX_ROWS_PER_STATEMENT),
            ));
        }

        let max_attempts: u32 = env_or("QUEUE_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(invalid("QUEUE_MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        Ok(Self {
            app_env: env_or("APP_ENV", "development".to_string())?,
            database,
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379".to_string())?,
            queue: QueueSettings {
                name: env_or("QUEUE_NAME", "user-operations".to_string())?,
                max_attempts,
                backoff_base: Duration::from_millis(env_or("QUEUE_BACKOFF_BASE_MS", 1000)?),
                block: Duration::from_millis(env_or("QUEUE_BLOCK_MS", 5000)?),
                lease_timeout: Duration::from_secs(env_or("QUEUE_LEASE_TIMEOUT_SECS", 300)?),
            },
            worker: WorkerSettings {
                concurrency,
                chunk_size,
            },
            cache: CacheSettings {
                invalidation_enabled: env_or("CACHE_INVALIDATION_ENABLED", true)?,
                broadcast_enabled: env_or("CACHE_BROADCAST_ENABLED", false)?,
            },
            metrics_port: env_or("METRICS_PORT", 9090)?,
        })
    }
}

/// Parse `key`, falling back to `default` when unset or blank.
/// A value that is present but unparsable is an error.
fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    parse_env_or(key, default).map_err(|reason| {
        let value = std::env::var(key).unwrap_or_default();
        invalid(key, &value, &reason)
    })
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "WORKER_CONCURRENCY",
        "BULK_CHUNK_SIZE",
        "QUEUE_MAX_ATTEMPTS",
        "QUEUE_NAME",
        "CACHE_BROADCAST_ENABLED",
        "LOG_FORMAT",
        "METRICS_PORT",
    ];

    fn reset_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
        std::env::set_var("DATABASE_URL", "postgres://localhost/user_ops_test");
    }

    #[test]
    #[serial]
    fn test_defaults() {
        reset_env();
        let config = Config::from_env().unwrap();

        assert_eq!(config.queue.name, "user-operations");
        assert_eq!(config.worker.concurrency, 1);
        assert_eq!(config.worker.chunk_size, 100);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.backoff_base, Duration::from_millis(1000));
        assert!(config.cache.invalidation_enabled);
        assert!(!config.cache.broadcast_enabled);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(LogFormat::from_env(), LogFormat::Text);
    }

    #[test]
    #[serial]
    fn test_overrides() {
        reset_env();
        std::env::set_var("WORKER_CONCURRENCY", "4");
        std::env::set_var("BULK_CHUNK_SIZE", "500");
        std::env::set_var("QUEUE_NAME", "bulk-users");
        std::env::set_var("CACHE_BROADCAST_ENABLED", "true");
        std::env::set_var("LOG_FORMAT", "json");
        std::env::set_var("METRICS_PORT", "9300");

        let config = Config::from_env().unwrap();
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.chunk_size, 500);
        assert_eq!(config.queue.name, "bulk-users");
        assert!(config.cache.broadcast_enabled);
        assert_eq!(config.metrics_port, 9300);
        assert_eq!(LogFormat::from_env(), LogFormat::Json);

        reset_env();
    }

    #[test]
    #[serial]
    fn test_chunk_size_bounds() {
        reset_env();
        std::env::set_var("BULK_CHUNK_SIZE", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                key: "BULK_CHUNK_SIZE",
                ..
            })
        ));

        std::env::set_var("BULK_CHUNK_SIZE", "16384");
        assert!(Config::from_env().is_err());

        std::env::set_var("BULK_CHUNK_SIZE", "16383");
        assert!(Config::from_env().is_ok());

        reset_env();
    }

    #[test]
    #[serial]
    fn test_unparsable_value_is_an_error() {
        reset_env();
        std::env::set_var("WORKER_CONCURRENCY", "many");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("WORKER_CONCURRENCY"));

        reset_env();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        reset_env();
        std::env::remove_var("DATABASE_URL");

        assert!(matches!(Config::from_env(), Err(ConfigError::Database(_))));

        reset_env();
    }
}
