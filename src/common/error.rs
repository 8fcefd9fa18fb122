//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use thiserror::Error;
use std::io;

/// Hub proxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address parsing or resolution error
    #[error("Network error: {0}")]
    Network(String),

    /// Wire protocol violation (malformed frame, unexpected handshake)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No destination socket for a routed message
    #[error("Routing error: {0}")]
    Routing(String),

    /// Tunnel setup failure (bind failure, duplicate listen port)
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
