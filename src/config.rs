use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Number of worker tasks servicing the dispatch queue
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the dispatch queue; once full, the acceptor blocks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Maximum total cache size in bytes
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    /// Per-object ceiling in bytes; larger responses are streamed, never cached
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
    /// Path to the append-only persistence log; None disables persistence
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    32
}

fn default_max_size() -> u64 {
    1_049_000
}

fn default_max_object_size() -> u64 {
    102_400
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_object_size: default_max_object_size(),
            persist_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> ProxyResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| {
                ProxyError::config(format!(
                    "failed to read {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ProxyResult<()> {
        if self.server.workers == 0 {
            return Err(ProxyError::config("server.workers must be greater than 0"));
        }
        if self.server.queue_capacity == 0 {
            return Err(ProxyError::config(
                "server.queue_capacity must be greater than 0",
            ));
        }
        if self.cache.max_size == 0 {
            return Err(ProxyError::config("cache.max_size must be greater than 0"));
        }
        if self.cache.max_object_size == 0 {
            return Err(ProxyError::config(
                "cache.max_object_size must be greater than 0",
            ));
        }
        if self.cache.max_object_size > self.cache.max_size {
            return Err(ProxyError::config(
                "cache.max_object_size cannot exceed cache.max_size",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.server.workers, 8);
        assert_eq!(config.server.queue_capacity, 32);
        assert_eq!(config.cache.max_size, 1_049_000);
        assert_eq!(config.cache.max_object_size, 102_400);
        assert!(config.cache.persist_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.server.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.max_object_size = config.cache.max_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [server]
            workers = 4
            queue_capacity = 16

            [cache]
            max_size = 2048
            max_object_size = 512
            persist_path = "/tmp/recache.log"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.queue_capacity, 16);
        assert_eq!(config.cache.max_size, 2048);
        assert_eq!(config.cache.max_object_size, 512);
        assert_eq!(
            config.cache.persist_path,
            Some(PathBuf::from("/tmp/recache.log"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [cache]
            max_size = 4096
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.workers, 8);
        assert_eq!(config.cache.max_size, 4096);
        assert_eq!(config.cache.max_object_size, 102_400);
    }

    #[tokio::test]
    async fn test_from_file_missing() {
        let result = Config::from_file("/nonexistent/recache.toml").await;
        assert!(matches!(result, Err(ProxyError::Config { .. })));
    }
}
