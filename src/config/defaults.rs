//! Default configuration values
//!
//! This module provides default values for configuration options.
//! It is designed to be a single source of truth for defaults,
//! making it easier to maintain consistent defaults across the application.

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "HUB_PROXY_";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

// Functions for default values

/// Default base port for the bulk-data listener
pub fn data_port() -> u16 {
    31094
}

/// Whether to retry the next port when the base port is taken
pub fn port_increment() -> bool {
    true
}

/// Default connect deadline in seconds
///
/// Bounds the whole outbound connect batch of `connect_remote_data`,
/// and doubles as the Identify idle timeout for accepted connections.
pub fn connect_timeout() -> u64 {
    10
}

/// Default per-direction bridge buffer size (256 KiB)
pub fn buffer_size() -> usize {
    256 * 1024
}

/// Default cap on concurrently borrowed bridge buffers
///
/// Two buffers per bridged stream, so this bounds live streams at half
/// its value.
pub fn max_tunnel_buffers() -> usize {
    64
}

/// Default advertised protocol version
pub fn protocol_version() -> u32 {
    1
}

/// Default log level
pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}
