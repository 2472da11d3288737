//! Daemon-level errors.

use super::{AnalyserError, ClientError, StorageError};

/// Errors that can occur while processing a container.
#[derive(Debug, thiserror::Error)]
pub enum SharderError {
    #[error("No mounted device available: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Analyser error: {0}")]
    Analyser(#[from] AnalyserError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
