//! Registry backend configuration types.

use serde::{Deserialize, Serialize};
use url::Url;

/// Registry backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisConfig {
    // Redis connection URL
    // redis://[:password@]host[:port][/db]
    pub url: String,
    // Connection pool max size
    #[serde(default = "default_redis_pool_max")]
    pub pool_max: usize,
    // Key namespace, lets several clusters share one Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_pool_max() -> usize {
    16
}

fn default_key_prefix() -> String {
    "congress".to_string()
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_max: default_redis_pool_max(),
            key_prefix: default_key_prefix(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let s = self.url.trim();
        if s.is_empty() {
            return Err("redis url should not be empty".to_string());
        }

        let url = Url::parse(s).map_err(|e| format!("invalid redis url: {}", e))?;

        let scheme = url.scheme();
        if scheme != "redis" && scheme != "rediss" {
            return Err(format!("unsupported URL scheme: {}", scheme));
        }

        if url.host().is_none() {
            return Err("redis url must have a host".to_string());
        }

        if self.pool_max == 0 {
            return Err("pool_max must be greater than 0".to_string());
        }

        if self.key_prefix.trim().is_empty() {
            return Err("key_prefix should not be empty".to_string());
        }

        Ok(())
    }
}
