//! Configuration module
//!
//! This module handles application configuration, including loading from
//! different sources (files, environment variables) and validating the
//! configuration.

mod defaults;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::common::{ProxyError, Result};

/// Proxy configuration
///
/// Contains all configuration options needed by the data proxy and the
/// tunnel manager. Supports loading from configuration files and
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct ProxyConfig {
    // --- Network settings ---

    /// Base port for the bulk-data listener
    #[serde(default = "defaults::data_port")]
    pub data_port: u16,

    /// Retry the next port when the base port is taken
    #[serde(default = "defaults::port_increment")]
    pub port_increment: bool,

    /// Connect deadline in seconds
    /// Bounds the outbound connect batch of `connect_remote_data` and
    /// the Identify idle timeout on accepted connections
    #[serde(default = "defaults::connect_timeout")]
    pub connect_timeout: u64,

    // --- Transfer settings ---

    /// Per-direction bridge buffer size (in bytes)
    /// Larger buffers may improve throughput but increase memory usage
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,

    /// Cap on concurrently borrowed bridge buffers (two per stream)
    #[serde(default = "defaults::max_tunnel_buffers")]
    pub max_tunnel_buffers: usize,

    // --- General settings ---

    /// Protocol version advertised in the Identify handshake
    #[serde(default = "defaults::protocol_version")]
    pub protocol_version: u32,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

impl Default for ProxyConfig {
    /// Create a default configuration using centralized defaults
    #[inline]
    fn default() -> Self {
        Self {
            data_port: defaults::data_port(),
            port_increment: defaults::port_increment(),
            connect_timeout: defaults::connect_timeout(),
            buffer_size: defaults::buffer_size(),
            max_tunnel_buffers: defaults::max_tunnel_buffers(),
            protocol_version: defaults::protocol_version(),
            log_level: defaults::log_level(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!(
                "Failed to read configuration file {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            ProxyError::Config(format!(
                "Failed to parse configuration file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Load configuration overrides from environment variables
    ///
    /// Each field is read from `HUB_PROXY_<FIELD>` (upper-case); unset
    /// variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let get = |name: &str| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok();
        let parse_err = |name: &str, v: &str| {
            ProxyError::Config(format!("Invalid {}{} value: {}", ENV_PREFIX, name, v))
        };

        let mut config = Self::default();

        if let Some(v) = get("DATA_PORT") {
            config.data_port = v.parse().map_err(|_| parse_err("DATA_PORT", &v))?;
        }
        if let Some(v) = get("PORT_INCREMENT") {
            config.port_increment = v.to_lowercase() == "true";
        }
        if let Some(v) = get("CONNECT_TIMEOUT") {
            config.connect_timeout = v.parse().map_err(|_| parse_err("CONNECT_TIMEOUT", &v))?;
        }
        if let Some(v) = get("BUFFER_SIZE") {
            config.buffer_size = v.parse().map_err(|_| parse_err("BUFFER_SIZE", &v))?;
        }
        if let Some(v) = get("MAX_TUNNEL_BUFFERS") {
            config.max_tunnel_buffers =
                v.parse().map_err(|_| parse_err("MAX_TUNNEL_BUFFERS", &v))?;
        }
        if let Some(v) = get("PROTOCOL_VERSION") {
            config.protocol_version = v.parse().map_err(|_| parse_err("PROTOCOL_VERSION", &v))?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            config.log_level = v;
        }

        Ok(config)
    }

    /// Merge another configuration into this one
    ///
    /// Fields of `other` that differ from the defaults take precedence;
    /// everything else keeps the current value.
    pub fn merge(self, other: ProxyConfig) -> Self {
        let base = ProxyConfig::default();

        macro_rules! pick {
            ($field:ident) => {
                if other.$field != base.$field {
                    other.$field
                } else {
                    self.$field
                }
            };
        }

        Self {
            data_port: pick!(data_port),
            port_increment: pick!(port_increment),
            connect_timeout: pick!(connect_timeout),
            buffer_size: pick!(buffer_size),
            max_tunnel_buffers: pick!(max_tunnel_buffers),
            protocol_version: pick!(protocol_version),
            log_level: pick!(log_level),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(ProxyError::Config("buffer_size must be non-zero".to_string()));
        }

        if self.connect_timeout == 0 {
            return Err(ProxyError::Config(
                "connect_timeout must be non-zero".to_string(),
            ));
        }

        if self.max_tunnel_buffers < 2 {
            return Err(ProxyError::Config(
                "max_tunnel_buffers must allow at least one bridged stream".to_string(),
            ));
        }

        Ok(())
    }
}

/// Log the configuration
pub fn log_config(config: &ProxyConfig) {
    use log::info;

    if !log::log_enabled!(log::Level::Info) {
        return;
    }

    info!("=== Final Configuration ===");
    info!("  Data port: {} (increment: {})", config.data_port, config.port_increment);
    info!("  Connect timeout: {} seconds", config.connect_timeout);
    info!("  Bridge buffer size: {} bytes", config.buffer_size);
    info!("  Max bridge buffers: {}", config.max_tunnel_buffers);
    info!("  Protocol version: {}", config.protocol_version);
    info!("  Log level: {}", config.log_level);
    info!("=========================");
}

// Global configuration storage
use once_cell::sync::Lazy;
use std::sync::RwLock;

static CONFIG: Lazy<RwLock<ProxyConfig>> = Lazy::new(|| RwLock::new(ProxyConfig::default()));

/// Initialize the global configuration
///
/// Layers, in increasing precedence: defaults, the optional
/// configuration file, environment variables.
pub fn initialize(config_file: Option<&Path>) -> Result<()> {
    let mut config = ProxyConfig::default();

    if let Some(path) = config_file {
        config = config.merge(ProxyConfig::from_file(path)?);
    }

    config = config.merge(ProxyConfig::from_env()?);
    config.validate()?;

    log_config(&config);

    let mut global = CONFIG.write().unwrap();
    *global = config;

    Ok(())
}

/// Retrieve a copy of the global configuration
pub fn get_config() -> ProxyConfig {
    CONFIG.read().unwrap().clone()
}

/// Replace the global configuration
pub fn update_config(config: ProxyConfig) -> Result<()> {
    config.validate()?;

    let mut global = CONFIG.write().unwrap();
    *global = config;

    Ok(())
}

// Export constants needed externally
pub use defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX, LOG_LEVEL_STR};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.connect_timeout, 10);
        assert_eq!(config.buffer_size, 256 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_prefers_overrides() {
        let mut overrides = ProxyConfig::default();
        overrides.data_port = 42000;
        overrides.log_level = "debug".to_string();

        let merged = ProxyConfig::default().merge(overrides);
        assert_eq!(merged.data_port, 42000);
        assert_eq!(merged.log_level, "debug");
        // Untouched fields keep defaults
        assert_eq!(merged.buffer_size, 256 * 1024);
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let mut config = ProxyConfig::default();
        config.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.connect_timeout = 0;
        assert!(config.validate().is_err());
    }
}
