//! Cache-layer error types.

use shoal_cluster::ClusterError;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by cache and block operations.
///
/// Clonable by design: a background flush failure is stashed per owner
/// and rethrown from the next cache access.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The caller passed an out-of-range offset or length.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The cluster could not serve the block.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<ClusterError> for CacheError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::InvalidArgument(msg) => CacheError::InvalidArgument(msg),
            other => CacheError::Io(other.to_string()),
        }
    }
}
