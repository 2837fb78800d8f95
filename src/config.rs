// Configuration module for octo-proxy
// Builds ProxyConfig either from listener/target/metrics flags or from a YAML file

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Name given to the single server synthesized from command-line flags.
pub const DEFAULT_SERVER_NAME: &str = "default";

/// Target connect timeout applied when a server does not set `timeout`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Empty target address at position {0}")]
    EmptyTarget(usize),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A `host:port` pair. An empty host on a listener binds every interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: String,
    pub port: u16,
}

impl HostConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HostConfig {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, splitting on the last colon. `[v6]:port` is accepted.
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidAddress {
            address: address.to_string(),
            reason,
        };

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port".to_string()))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let port: u16 = port
            .parse()
            .map_err(|_| invalid(format!("invalid port '{}'", port)))?;

        if port == 0 {
            return Err(invalid("port must be between 1 and 65535".to_string()));
        }

        Ok(HostConfig::new(host, port))
    }

    /// Renders the pair back into a dialable/bindable `host:port` string.
    pub fn address(&self) -> String {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };

        if host.contains(':') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,

    pub listener: HostConfig,

    /// Ordered; selection rotates through them in this order.
    pub targets: Vec<HostConfig>,

    /// Seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub servers: Vec<ServerConfig>,

    /// No metrics endpoint is started when absent.
    #[serde(default)]
    pub metrics: Option<HostConfig>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one server must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut listeners = HashSet::new();

        for server in &self.servers {
            if server.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "server name must not be empty".to_string(),
                ));
            }

            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }

            if server.listener.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "server '{}': listener port must be between 1 and 65535",
                    server.name
                )));
            }

            if !listeners.insert(server.listener.address()) {
                return Err(ConfigError::Invalid(format!(
                    "server '{}': listener {} is already used by another server",
                    server.name, server.listener
                )));
            }

            if server.targets.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server '{}' has no targets",
                    server.name
                )));
            }

            for target in &server.targets {
                if target.host.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "server '{}': target host must not be empty",
                        server.name
                    )));
                }

                if target.port == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "server '{}': target port must be between 1 and 65535",
                        server.name
                    )));
                }
            }

            if server.timeout == 0 {
                return Err(ConfigError::Invalid(format!(
                    "server '{}': timeout must be greater than 0",
                    server.name
                )));
            }
        }

        if let Some(metrics) = &self.metrics {
            if metrics.port == 0 {
                return Err(ConfigError::Invalid(
                    "metrics port must be between 1 and 65535".to_string(),
                ));
            }

            if listeners.contains(&metrics.address()) {
                return Err(ConfigError::Invalid(format!(
                    "metrics address {} cannot be the same as a server listener",
                    metrics
                )));
            }
        }

        Ok(())
    }
}

/// Synthesizes a single-server configuration from command-line values.
///
/// Targets keep their order and duplicates. Empty elements (as produced by
/// `"a:1,,b:2"`) are rejected rather than dropped.
pub fn generate(
    listener: &str,
    targets: &[String],
    metrics: &str,
) -> Result<ProxyConfig, ConfigError> {
    let listener = HostConfig::parse(listener)?;
    let metrics = HostConfig::parse(metrics)?;

    let targets = targets
        .iter()
        .enumerate()
        .map(|(i, target)| {
            if target.is_empty() {
                Err(ConfigError::EmptyTarget(i))
            } else {
                HostConfig::parse(target)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let config = ProxyConfig {
        servers: vec![ServerConfig {
            name: DEFAULT_SERVER_NAME.to_string(),
            listener,
            targets,
            timeout: DEFAULT_TIMEOUT_SECS,
        }],
        metrics: Some(metrics),
    };

    config.validate()?;

    Ok(config)
}

/// Reads, parses and validates a YAML configuration file.
pub fn load(path: impl AsRef<Path>) -> Result<ProxyConfig, ConfigError> {
    let path = path.as_ref();

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let config: ProxyConfig =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

    config.validate()?;

    Ok(config)
}
