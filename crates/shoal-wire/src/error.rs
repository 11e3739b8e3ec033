//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while sealing or decoding envelopes and
/// messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The stream does not start with an envelope preamble.
    #[error("bad envelope preamble: {found:02x?}")]
    BadPreamble { found: [u8; 2] },

    /// The peer speaks a different wire revision.
    #[error("unsupported wire revision: {0}")]
    UnsupportedRevision(u8),

    /// Payload exceeds the maximum allowed size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The envelope trailer does not match its content.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for WireError {
    fn from(e: bincode::Error) -> Self {
        WireError::Serialization(e.to_string())
    }
}
