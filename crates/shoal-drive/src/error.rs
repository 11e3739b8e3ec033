//! Connection-layer error types.

use thiserror::Error;

/// Result type for connection operations.
pub type DriveResult<T> = Result<T, DriveError>;

/// Errors surfaced by the connection layer.
#[derive(Debug, Error)]
pub enum DriveError {
    /// No healthy connection to the drive; a background reconnect may
    /// have been scheduled.
    #[error("no valid connection to {0}")]
    NotConnected(String),

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that do not decode as protocol envelopes.
    #[error("protocol error: {0}")]
    Protocol(#[from] shoal_wire::WireError),
}
