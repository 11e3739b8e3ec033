//! Library error types and their POSIX errno mapping.

use shoal_cache::CacheError;
use shoal_cluster::ClusterError;
use thiserror::Error;

/// Result alias for the public surface.
pub type ShoalResult<T> = Result<T, ShoalError>;

/// Errors surfaced to library users.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShoalError {
    /// The path is not of the form `kinetic://{clusterID}/{name}`.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The cluster id is not present in the configuration.
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    /// The configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// No healthy connection to the drives backing the operation.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// An argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The cluster could not serve the operation.
    #[error("i/o error: {0}")]
    Io(String),
}

impl ShoalError {
    /// Maps this error to the errno a file-system shim should report.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidPath(_) | Self::Config(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::UnknownCluster(_) => libc::ENODEV,
            Self::NotConnected(_) => libc::ENXIO,
            Self::Io(_) => libc::EIO,
        }
    }
}

impl From<CacheError> for ShoalError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::InvalidArgument(msg) => ShoalError::InvalidArgument(msg),
            CacheError::Io(msg) => ShoalError::Io(msg),
        }
    }
}

impl From<ClusterError> for ShoalError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::InvalidArgument(msg) => ShoalError::InvalidArgument(msg),
            ClusterError::NotConnected(msg) => ShoalError::NotConnected(msg),
            other => ShoalError::Io(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ShoalError {
    fn from(e: std::io::Error) -> Self {
        ShoalError::Io(e.to_string())
    }
}
