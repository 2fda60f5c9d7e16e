//! Error types for the orchestrator

use std::io;
use thiserror::Error;

/// Orchestrator error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Port forwarding error: {0}")]
    PortForward(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn provider<S: Into<String>>(msg: S) -> Self {
        Error::Provider(msg.into())
    }

    pub fn firewall<S: Into<String>>(msg: S) -> Self {
        Error::Firewall(msg.into())
    }

    pub fn tunnel<S: Into<String>>(msg: S) -> Self {
        Error::Tunnel(msg.into())
    }

    pub fn port_forward<S: Into<String>>(msg: S) -> Self {
        Error::PortForward(msg.into())
    }

    pub fn dns<S: Into<String>>(msg: S) -> Self {
        Error::Dns(msg.into())
    }

    pub fn proxy<S: Into<String>>(msg: S) -> Self {
        Error::Proxy(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Error::Network(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn invalid_status<S: Into<String>>(msg: S) -> Self {
        Error::InvalidStatus(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

#[cfg(unix)]
impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(io::Error::from(e))
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::provider("no server found");
        assert!(matches!(e, Error::Provider(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::invalid_status("Crashed");
        assert_eq!(e.to_string(), "Invalid status: Crashed");
    }
}
