//! # shoal-wire: Drive wire protocol
//!
//! The binary protocol spoken between clients and shoal drives. A
//! message is a bincode-serialized [`Request`] or [`Response`] carried
//! inside a CRC32-sealed envelope (see [`envelope`]).
//!
//! Requests carry a connection-scoped id; responses echo it, which lets
//! a single connection multiplex many in-flight operations.

pub mod envelope;
mod error;
mod message;

pub use envelope::{seal, EnvelopeDecoder, ENVELOPE_OVERHEAD, MAX_PAYLOAD_LEN, WIRE_REVISION};
pub use error::{WireError, WireResult};
pub use message::{
    checksum_tag, ChecksumAlgorithm, DriveCapacity, DriveLimits, DriveLog, GetLogType, PersistMode,
    Record, Request, RequestPayload, Response, ResponsePayload, WriteMode,
};
