//! Configuration loading for a CacheGopher node.
//!
//! Mirrors the shape of the original Go `config.Configuration`, extended
//! with the multi-server replication topology every node needs to resolve
//! its own role and its secondaries/primary.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("server id '{0}' not found in config")]
    ServerNotFound(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(rename = "clientConf")]
    pub client_conf: ClientConf,
    pub common: CommonConf,
    pub servers: Vec<ServerConf>,
    pub logging: LoggingConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConf {
    #[serde(rename = "connectionTimeout")]
    pub connection_timeout_ms: u64,
    #[serde(rename = "keepAliveInterval")]
    pub keep_alive_interval_ms: u64,
    #[serde(rename = "unHealthyInterval")]
    pub unhealthy_interval_ms: u64,
}

impl ClientConf {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn unhealthy_interval(&self) -> Duration {
        Duration::from_millis(self.unhealthy_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConf {
    #[serde(rename = "maxSize")]
    pub max_size: usize,
    #[serde(rename = "evictionPolicy")]
    pub eviction_policy: String,
    pub production: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConf {
    pub id: String,
    pub address: String,
    pub role: ServerRole,
    #[serde(default)]
    pub secondaries: Vec<String>,
    #[serde(default)]
    pub primary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConf {
    pub level: String,
    pub file: Option<String>,
}

impl Configuration {
    /// Load and parse a JSON config file, then validate it.
    ///
    /// Grounded on `enterprise::cluster::config::ClusterConfig::from_file`:
    /// read the whole file, `serde_json::from_str`, then run structural
    /// validation separately from parsing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Configuration = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.common.max_size < 1 {
            return Err(ConfigError::Invalid("common.maxSize must be >= 1".into()));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("servers must not be empty".into()));
        }

        let mut ids = HashSet::new();
        for server in &self.servers {
            if !ids.insert(server.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server id '{}'",
                    server.id
                )));
            }
            match server.role {
                ServerRole::Primary if server.primary.is_some() => {
                    return Err(ConfigError::Invalid(format!(
                        "server '{}' is primary but declares a primary field",
                        server.id
                    )));
                }
                ServerRole::Secondary if server.primary.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "server '{}' is secondary but has no primary field",
                        server.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn server(&self, id: &str) -> Result<&ServerConf> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| ConfigError::ServerNotFound(id.to_string()))
    }

    /// Secondaries of `id`, resolved to their `ServerConf`.
    pub fn secondaries_of(&self, id: &str) -> Result<Vec<&ServerConf>> {
        let server = self.server(id)?;
        server
            .secondaries
            .iter()
            .map(|sid| self.server(sid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Configuration {
        Configuration {
            client_conf: ClientConf {
                connection_timeout_ms: 5000,
                keep_alive_interval_ms: 30_000,
                unhealthy_interval_ms: 10_000,
            },
            common: CommonConf {
                max_size: 1024,
                eviction_policy: "LRU".into(),
                production: false,
            },
            servers: vec![
                ServerConf {
                    id: "node-a".into(),
                    address: "127.0.0.1:9001".into(),
                    role: ServerRole::Primary,
                    secondaries: vec!["node-b".into()],
                    primary: None,
                },
                ServerConf {
                    id: "node-b".into(),
                    address: "127.0.0.1:9002".into(),
                    role: ServerRole::Secondary,
                    secondaries: vec![],
                    primary: Some("node-a".into()),
                },
            ],
            logging: LoggingConf {
                level: "info".into(),
                file: None,
            },
        }
    }

    #[test]
    fn validates_good_config() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut cfg = sample();
        cfg.common.max_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut cfg = sample();
        cfg.servers[1].id = "node-a".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolves_secondaries() {
        let cfg = sample();
        let secs = cfg.secondaries_of("node-a").unwrap();
        assert_eq!(secs.len(), 1);
        assert_eq!(secs[0].id, "node-b");
    }
}
