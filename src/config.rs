use serde::{Deserialize, Serialize};

use crate::{
    error::{RateLimitError, Result},
    identity::IdentityStrategy,
    redis::RedisConfig,
};

/// Prefix for environment overrides, e.g. `RATE_GUARD__MAX_HITS=10`
pub const ENV_PREFIX: &str = "RATE_GUARD";

/// Which counter store backs the limiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Local,
    Shared,
}

/// Construction-time settings for one limiter and the process serving it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub window_ms: u64,
    pub max_hits: u64,
    pub identity: IdentityStrategy,
    pub session_cookie: String,
    pub backend: Backend,
    pub redis: Option<RedisConfig>,
    pub listen_addr: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window_ms: 3000,
            max_hits: 3,
            identity: IdentityStrategy::Ip,
            session_cookie: "session".to_string(),
            backend: Backend::Local,
            redis: None,
            listen_addr: "0.0.0.0:65535".to_string(),
        }
    }
}

impl GuardConfig {
    /// Load from an optional YAML file, then apply `RATE_GUARD__*` environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config: GuardConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the limiter meaningless. Nothing is defaulted here.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(RateLimitError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_hits == 0 {
            return Err(RateLimitError::Config(
                "max_hits must be at least 1".to_string(),
            ));
        }
        if self.backend == Backend::Shared {
            match &self.redis {
                Some(redis) if !redis.url.trim().is_empty() => {}
                Some(_) => {
                    return Err(RateLimitError::Config(
                        "shared backend requires a non-empty redis.url".to_string(),
                    ))
                }
                None => {
                    return Err(RateLimitError::Config(
                        "shared backend selected but no redis connection settings given".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<GuardConfig> {
    let config: GuardConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<GuardConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}
