//! Error types shared by the unicornscan crates

use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Result type alias for unicornscan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for scan setup and runtime operations
#[derive(Error, Debug)]
pub enum Error {
    /// Network-related errors (capture, injection, socket setup)
    #[error("Network error: {0}")]
    Network(String),

    /// I/O errors with automatic conversion
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Parsing errors for addresses, modes, templates
    #[error("Parse error: {0}")]
    Parse(String),

    /// Permission/capability errors
    #[error("Insufficient privileges: {0}")]
    Privilege(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid target specification
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Invalid port list expression
    #[error("Invalid port list: {0}")]
    InvalidPortList(String),

    /// Malformed or short IPC frame
    #[error("IPC protocol error: {0}")]
    Ipc(String),

    /// Drone connection failures (the master logs and continues)
    #[error("Drone error: {0}")]
    Drone(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::Parse(format!("Invalid IP address: {}", err))
    }
}

impl From<ipnetwork::IpNetworkError> for Error {
    fn from(err: ipnetwork::IpNetworkError) -> Self {
        Error::Parse(format!("Invalid IP network: {}", err))
    }
}
