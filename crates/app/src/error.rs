//! Startup and wiring errors.

use messaging::MessagingError;
use thiserror::Error;

/// Errors that stop the process from starting.
#[derive(Debug, Error)]
pub enum AppError {
    /// Tracing or metrics could not be installed.
    #[error("Telemetry setup failed: {0}")]
    Telemetry(String),

    /// A router or converter registry was declared inconsistently.
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// The ops endpoint could not bind or serve.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for application results.
pub type Result<T> = std::result::Result<T, AppError>;
