//! # shoal-types: Core types for the shoal drive-fleet I/O library
//!
//! This crate contains shared types used across the shoal system:
//! - Drive status reporting ([`StatusCode`], [`DriveStatus`])
//! - Optimistic-concurrency tokens ([`ValueVersion`])
//! - Cluster metadata ([`ClusterLimits`], [`ClusterSize`])
//! - Block key construction ([`block_key`])

use std::fmt::Display;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Status Codes - Copy (simple enum, no heap data)
// ============================================================================

/// Outcome of a single drive operation.
///
/// Remote codes are produced by the drive; client codes are synthesized on
/// this side of the wire (connection loss, timeouts, bugs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Operation succeeded.
    Ok,
    /// The requested key does not exist on the drive.
    NotFound,
    /// The supplied prior version did not match the stored version.
    VersionMismatch,
    /// No usable connection to the drive.
    ConnectionError,
    /// I/O failure: timeout, socket error, or quorum failure.
    IoError,
    /// A failure that indicates a bug rather than an environmental problem.
    InternalError,
}

impl StatusCode {
    /// Returns true for [`StatusCode::Ok`].
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::VersionMismatch => "VERSION_MISMATCH",
            StatusCode::ConnectionError => "CONNECTION_ERROR",
            StatusCode::IoError => "IO_ERROR",
            StatusCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{name}")
    }
}

/// A status code with its human-readable context message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveStatus {
    pub code: StatusCode,
    pub message: String,
}

impl DriveStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a success status with no message.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

impl Display for DriveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

// ============================================================================
// Value Versions
// ============================================================================

/// Encoded length of a version: 16-byte UUID followed by the big-endian
/// original value size.
const VERSION_LEN: usize = 16 + 8;

/// Opaque optimistic-concurrency token for a stored value.
///
/// Every write generates a fresh version. The version additionally carries
/// the original (pre-padding) value size, so readers can trim a
/// reassembled stripe back to the exact logical length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueVersion(Bytes);

impl ValueVersion {
    /// Generates a new unique version encoding `value_size`.
    pub fn generate(value_size: u64) -> Self {
        let mut buf = Vec::with_capacity(VERSION_LEN);
        buf.extend_from_slice(Uuid::new_v4().as_bytes());
        buf.extend_from_slice(&value_size.to_be_bytes());
        Self(Bytes::from(buf))
    }

    /// Wraps raw version bytes received from a drive.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The original value size encoded in this version.
    ///
    /// Malformed versions (wrong length) decode as size 0.
    pub fn decode_size(&self) -> u64 {
        if self.0.len() != VERSION_LEN {
            return 0;
        }
        let mut size = [0_u8; 8];
        size.copy_from_slice(&self.0[16..]);
        u64::from_be_bytes(size)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

// ============================================================================
// Cluster Metadata
// ============================================================================

/// Per-cluster operational limits.
///
/// `max_value_size` is per shard as reported by a drive; the cluster
/// facade multiplies it by the data-shard count before exposing it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLimits {
    pub max_key_size: u64,
    pub max_value_size: u64,
    pub max_version_size: u64,
}

/// Aggregated capacity of all drives in a cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSize {
    pub bytes_total: u64,
    pub bytes_free: u64,
}

// ============================================================================
// Block Keys
// ============================================================================

/// Constructs the drive key for logical block `blocknumber` of a file.
pub fn block_key(basename: &str, blocknumber: u64) -> Bytes {
    Bytes::from(format!("{basename}_{blocknumber}"))
}

#[cfg(test)]
mod tests;
