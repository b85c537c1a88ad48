//! Error types for the RAOP sink

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors, all raised before any worker is started
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing server address")]
    MissingServer,

    #[error("Invalid sample specification: {0}")]
    InvalidSampleSpec(String),

    #[error("Invalid timing watchdog settings: {0}")]
    InvalidTiming(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by the protocol client
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Client creation failed: {0}")]
    Creation(String),

    #[error("Session not connected")]
    NotConnected,

    #[error("Request rejected by receiver: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streaming worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),

    #[error("Worker is no longer running")]
    Gone,

    #[error("Readiness wait failed: {0}")]
    Poll(std::io::Error),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
