//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::Result;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port`; an empty host (`:9000`) listens on all interfaces
    pub listen_addr: String,
    /// Static diagnostic page served on `/test`
    pub test_page: PathBuf,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Upstream allow-list configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Comma-separated list of loopback ports clients may reach
    pub accepted_ports: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":9000".to_string(),
            test_page: PathBuf::from("test.html"),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            accepted_ports: "8484,8585".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Resolve `listen_addr` into a bindable socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        };

        addr.to_socket_addrs()
            .with_context(|| format!("Invalid listen address: {}", self.listen_addr))?
            .next()
            .ok_or_else(|| anyhow!("Listen address {} resolved to nothing", self.listen_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, ":9000");
        assert_eq!(config.upstream.accepted_ports, "8484,8585");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.server.test_page, PathBuf::from("test.html"));
    }

    #[test]
    fn test_empty_host_listens_everywhere() {
        let server = ServerConfig::default();
        assert_eq!(server.socket_addr().unwrap(), "0.0.0.0:9000".parse().unwrap());
    }

    #[test]
    fn test_explicit_host() {
        let server = ServerConfig {
            listen_addr: "127.0.0.1:9100".to_string(),
            ..Default::default()
        };
        assert_eq!(server.socket_addr().unwrap(), "127.0.0.1:9100".parse().unwrap());
    }

    #[test]
    fn test_invalid_listen_addr() {
        let server = ServerConfig {
            listen_addr: "not an address".to_string(),
            ..Default::default()
        };
        assert!(server.socket_addr().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            accepted_ports = "7000"
            "#,
        )
        .unwrap();
        assert_eq!(config.upstream.accepted_ports, "7000");
        assert_eq!(config.server.listen_addr, ":9000");
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(10));
    }
}
