//! Error type shared by the observers.

use thiserror::Error;

/// Failure while building or encoding exported metrics.
#[derive(Debug, Error)]
pub enum ObserverError {
    /// Error creating, registering or encoding a Prometheus metric.
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Encoded output was not valid UTF-8.
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Result type for observer operations.
pub type Result<T> = std::result::Result<T, ObserverError>;
