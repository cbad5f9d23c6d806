//! Error types for the ingest gateway.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config [{path}]: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The config is not valid JSON or has the wrong shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range or inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// The shared secret could not be resolved.
    #[error("failed to load {what}: {reason}")]
    Secret { what: &'static str, reason: String },
}

/// Errors that can occur while running the gateway.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Binding the listening socket failed.
    #[error("failed to start server on [{uri}]: {source}")]
    Bind {
        uri: String,
        #[source]
        source: io::Error,
    },
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GateError>;
