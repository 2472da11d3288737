//! Errors from the container HTTP client.

/// Errors that can occur talking to a container server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: f64 },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Unexpected response status {status}")]
    Status { status: u16 },
}

impl ClientError {
    /// Timeouts and transport failures are retried; response statuses are not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Status { .. })
    }
}
