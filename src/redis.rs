use redis::{aio::ConnectionManager, AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tracing::{info, warn};

use crate::error::{RateLimitError, Result};

/// Reads the current window, restarts it when absent or elapsed, and
/// otherwise bumps the count. Runs as one script so concurrent callers on
/// the same key never interleave between the read and the write.
///
/// A value of the wrong type, or a hash with unreadable fields, is replaced
/// with a fresh window instead of failing every later call for that key.
///
/// KEYS[1] record key, ARGV[1] now (epoch ms), ARGV[2] window (ms).
/// Returns `{count, timestamp}`.
const INCREMENT_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local kind = redis.call('TYPE', KEYS[1]).ok
if kind ~= 'hash' and kind ~= 'none' then
  redis.call('DEL', KEYS[1])
end
local fields = redis.call('HMGET', KEYS[1], 'count', 'timestamp')
local count = tonumber(fields[1])
local started = tonumber(fields[2])
if (not count) or (not started) or (now - started > window) then
  redis.call('DEL', KEYS[1])
  redis.call('HSET', KEYS[1], 'count', 1, 'timestamp', now)
  redis.call('PEXPIRE', KEYS[1], window)
  return {1, now}
end
count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {count, started}
"#;

/// Redis connection settings for the shared counter store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: default_key_prefix(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Redis client wrapper for window accounting
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    increment_script: Script,
    command_timeout: Duration,
}

impl RedisClient {
    /// Connect and verify the connection with a PING
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::from(e)
        })?;

        let connection =
            match tokio::time::timeout(config.connection_timeout(), client.get_connection_manager())
                .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!("Failed to create connection manager: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!(
                        "Timeout while creating connection manager ({}ms)",
                        config.connection_timeout_ms
                    );
                    return Err(RateLimitError::BackendUnavailable(
                        "Timeout while creating Redis connection manager".to_string(),
                    ));
                }
            };

        let redis_client = Self {
            connection,
            increment_script: Script::new(INCREMENT_WINDOW_SCRIPT),
            command_timeout: config.command_timeout(),
        };

        redis_client.health_check().await?;
        info!("Redis client initialized successfully");
        Ok(redis_client)
    }

    /// Atomically advance the window stored at `key`, returning `(count, window_start_ms)`
    pub async fn increment_window(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<(i64, i64)> {
        let mut conn = self.connection.clone();
        let mut invocation = self.increment_script.prepare_invoke();
        invocation.key(key).arg(now_ms).arg(window_ms);

        self.bounded("increment", invocation.invoke_async::<_, (i64, i64)>(&mut conn))
            .await
    }

    /// Remove the record stored at `key`
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _removed: i64 = self.bounded("delete", conn.del::<_, i64>(key)).await?;
        Ok(())
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.bounded("ping", redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(RateLimitError::from),
            Err(_) => Err(RateLimitError::BackendUnavailable(format!(
                "Redis {} timed out after {}ms",
                operation,
                self.command_timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_defaults() {
        let config: RedisConfig = serde_yaml::from_str("url: redis://cache:6379").unwrap();
        assert_eq!(config.url, "redis://cache:6379");
        assert_eq!(config.key_prefix, "ratelimit:");
        assert_eq!(config.connection_timeout(), Duration::from_secs(5));
        assert_eq!(config.command_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_redis_config_requires_url() {
        let result: std::result::Result<RedisConfig, _> = serde_yaml::from_str("key_prefix: rl:");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_backend_unavailable() {
        let config = RedisConfig {
            connection_timeout_ms: 500,
            command_timeout_ms: 500,
            ..RedisConfig::new("redis://127.0.0.1:1")
        };

        let err = RedisClient::new(&config).await.err().unwrap();
        assert!(err.is_backend());
    }
}
