//! Cluster-level error types.

use shoal_types::{DriveStatus, StatusCode};
use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by cluster operations.
///
/// Individual drive failures are absorbed by the fan-out quorum; these
/// errors describe the aggregate outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The key does not exist (a quorum of drives agreed).
    #[error("key not found")]
    NotFound,

    /// The supplied prior version did not match the stored stripe.
    #[error("version mismatch")]
    VersionMismatch,

    /// No healthy connection to enough drives.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Quorum failure, timeout or unrecoverable stripe damage.
    #[error("i/o error: {0}")]
    Io(String),

    /// A failure that indicates a bug rather than drive state.
    #[error("internal error: {0}")]
    Internal(String),

    /// The caller passed an argument outside cluster limits.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClusterError {
    /// Maps an aggregate drive status to a cluster result.
    pub(crate) fn from_status(status: &DriveStatus) -> ClusterResult<()> {
        match status.code {
            StatusCode::Ok => Ok(()),
            StatusCode::NotFound => Err(ClusterError::NotFound),
            StatusCode::VersionMismatch => Err(ClusterError::VersionMismatch),
            StatusCode::ConnectionError => {
                Err(ClusterError::NotConnected(status.message.clone()))
            }
            StatusCode::IoError => Err(ClusterError::Io(status.message.clone())),
            StatusCode::InternalError => Err(ClusterError::Internal(status.message.clone())),
        }
    }
}
