//! Logging utility functions
//!
//! This module provides helpers for initializing the logging system.

/// Initialize the logging system
///
/// The `RUST_LOG` environment variable takes precedence over the
/// supplied default level. Safe to call more than once; repeated
/// initialization is ignored.
///
/// # Parameters
///
/// * `level` - Default log level
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    let _ = env_logger::Builder::from_env(env).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger() {
        // Double initialization must not panic
        init_logger("debug");
        init_logger("info");
    }
}
