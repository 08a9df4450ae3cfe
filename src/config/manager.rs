//! Configuration Manager

use super::Config;
use crate::policy::PortPolicy;
use crate::Result;
use anyhow::{bail, Context};
use std::path::{Path, PathBuf};

/// Environment variable overriding `server.listen_addr`
pub const ENV_LISTEN_ADDR: &str = "WSBRIDGE_LISTEN_ADDR";
/// Environment variable overriding `upstream.accepted_ports`
pub const ENV_ACCEPTED_PORTS: &str = "WSBRIDGE_ACCEPTED_UPSTREAM_PORTS";
/// Environment variable overriding `server.test_page`
pub const ENV_TEST_PAGE: &str = "WSBRIDGE_TEST_PAGE";
/// Environment variable overriding `server.shutdown_timeout`
pub const ENV_SHUTDOWN_TIMEOUT: &str = "WSBRIDGE_SHUTDOWN_TIMEOUT";
/// Environment variable overriding `logging.level`
pub const ENV_LOG_LEVEL: &str = "WSBRIDGE_LOG_LEVEL";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to defaults when it does not exist
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env(config: &mut Config) -> Result<()> {
        Self::apply_env_with(config, |key| std::env::var(key).ok())
    }

    /// Apply overrides using an arbitrary variable lookup
    pub fn apply_env_with<F>(config: &mut Config, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
            config.server.listen_addr = addr;
        }

        if let Some(ports) = lookup(ENV_ACCEPTED_PORTS) {
            config.upstream.accepted_ports = ports;
        }

        if let Some(page) = lookup(ENV_TEST_PAGE) {
            config.server.test_page = PathBuf::from(page);
        }

        if let Some(timeout) = lookup(ENV_SHUTDOWN_TIMEOUT) {
            config.server.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}: {}", ENV_SHUTDOWN_TIMEOUT, timeout))?;
        }

        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            config.logging.level = level;
        }

        Ok(())
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .socket_addr()
            .with_context(|| "Server configuration validation failed")?;

        let policy = self
            .port_policy()
            .with_context(|| "Upstream configuration validation failed")?;
        if policy.is_empty() {
            tracing::warn!("Accepted upstream port list is empty, every relay request will be rejected");
        }
        for port in policy.undialable() {
            tracing::warn!("Accepted upstream port {} is outside 1-65535 and will never be relayed", port);
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", VALID_LOG_LEVELS.join(", "));
        }

        Ok(())
    }

    /// Build the port allow-list from `upstream.accepted_ports`
    pub fn port_policy(&self) -> Result<PortPolicy> {
        PortPolicy::parse(&self.upstream.accepted_ports)
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        addr: Option<&str>,
        accepted_ports: Option<&str>,
        test_page: Option<&Path>,
        log_level: Option<&str>,
    ) {
        if let Some(addr) = addr {
            self.server.listen_addr = addr.to_string();
            tracing::info!("CLI override: listen address set to {}", addr);
        }

        if let Some(ports) = accepted_ports {
            self.upstream.accepted_ports = ports.to_string();
            tracing::info!("CLI override: accepted upstream ports set to {}", ports);
        }

        if let Some(page) = test_page {
            self.server.test_page = page.to_path_buf();
            tracing::info!("CLI override: test page set to {}", page.display());
        }

        if let Some(level) = log_level {
            self.logging.level = level.to_string();
        }
    }
}
