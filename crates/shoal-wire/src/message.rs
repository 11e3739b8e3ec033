//! Request and response message types for the drive protocol.
//!
//! Messages are serialized using bincode for efficient binary encoding.

use serde::{Deserialize, Serialize};
use shoal_types::{ClusterLimits, DriveStatus};

use crate::envelope::seal;
use crate::error::WireResult;

// ============================================================================
// Records
// ============================================================================

/// Checksum algorithm protecting a record's value bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Crc32,
}

/// Computes the checksum tag for a value: the decimal rendering of its
/// CRC32.
pub fn checksum_tag(value: &[u8]) -> String {
    crc32fast::hash(value).to_string()
}

/// A stored entry on a drive: value bytes, version token and integrity tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// The stored value bytes.
    pub value: Vec<u8>,
    /// Opaque version token shared by all shards of a stripe.
    pub version: Vec<u8>,
    /// Checksum of `value`, rendered per `algorithm`.
    pub tag: String,
    /// Algorithm that produced `tag`.
    pub algorithm: ChecksumAlgorithm,
}

impl Record {
    /// Builds a record for `value`, computing its CRC32 tag.
    pub fn new(value: Vec<u8>, version: Vec<u8>) -> Self {
        let tag = checksum_tag(&value);
        Self {
            value,
            version,
            tag,
            algorithm: ChecksumAlgorithm::Crc32,
        }
    }

    /// Verifies the stored tag against the value bytes.
    pub fn verify_tag(&self) -> bool {
        match self.algorithm {
            ChecksumAlgorithm::Crc32 => checksum_tag(&self.value) == self.tag,
        }
    }
}

// ============================================================================
// Write Semantics
// ============================================================================

/// Version precondition applied by Put and Delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// The stored version must equal the supplied prior version (an empty
    /// prior version matches only a missing key).
    RequireSameVersion,
    /// Overwrite regardless of the stored version.
    IgnoreVersion,
}

/// Durability requested from the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistMode {
    /// The drive may acknowledge from its write cache.
    WriteBack,
    /// The drive must persist before acknowledging.
    Flush,
}

// ============================================================================
// Drive Log
// ============================================================================

/// Log categories a client can request from a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetLogType {
    Capacities,
    Limits,
}

/// Capacity report of a single drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveCapacity {
    /// Total capacity of the drive in bytes.
    pub nominal_capacity_in_bytes: u64,
    /// Fraction of the capacity in use, in `[0.0, 1.0]`.
    pub portion_full: f64,
}

/// Operational limits of a single drive.
pub type DriveLimits = ClusterLimits;

/// Aggregated log response from a drive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveLog {
    pub capacity: DriveCapacity,
    pub limits: DriveLimits,
}

// ============================================================================
// Requests
// ============================================================================

/// A client request to a drive.
///
/// The `id` is scoped to one connection and echoed by the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub payload: RequestPayload,
}

impl Request {
    pub fn new(id: u64, payload: RequestPayload) -> Self {
        Self { id, payload }
    }

    /// Serializes the request into a sealed envelope.
    pub fn to_wire(&self) -> WireResult<Vec<u8>> {
        seal(&bincode::serialize(self)?)
    }

    /// Decodes a request from a decoded envelope payload.
    pub fn from_payload(payload: &[u8]) -> WireResult<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Request payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestPayload {
    /// Read the full record stored under a key.
    Get { key: Vec<u8> },
    /// Read only the version stored under a key.
    GetVersion { key: Vec<u8> },
    /// Store a record under a key.
    Put {
        key: Vec<u8>,
        prior_version: Vec<u8>,
        mode: WriteMode,
        record: Record,
        persist: PersistMode,
    },
    /// Delete the record stored under a key.
    Delete {
        key: Vec<u8>,
        prior_version: Vec<u8>,
        mode: WriteMode,
        persist: PersistMode,
    },
    /// Enumerate keys in a range.
    GetKeyRange {
        start: Vec<u8>,
        end: Vec<u8>,
        start_inclusive: bool,
        end_inclusive: bool,
        reverse: bool,
        max_returned: u32,
    },
    /// Request drive log categories.
    GetLog { types: Vec<GetLogType> },
    /// Liveness probe.
    Noop,
}

// ============================================================================
// Responses
// ============================================================================

/// A drive response, matched to its request by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: DriveStatus,
    pub payload: ResponsePayload,
}

impl Response {
    pub fn new(id: u64, status: DriveStatus, payload: ResponsePayload) -> Self {
        Self {
            id,
            status,
            payload,
        }
    }

    /// Shorthand for an error response without payload.
    pub fn error(id: u64, status: DriveStatus) -> Self {
        Self::new(id, status, ResponsePayload::None)
    }

    /// Serializes the response into a sealed envelope.
    pub fn to_wire(&self) -> WireResult<Vec<u8>> {
        seal(&bincode::serialize(self)?)
    }

    /// Decodes a response from a decoded envelope payload.
    pub fn from_payload(payload: &[u8]) -> WireResult<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Response payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Full record (Get).
    Record(Record),
    /// Version only (GetVersion).
    Version(Vec<u8>),
    /// Key list (GetKeyRange).
    Keys(Vec<Vec<u8>>),
    /// Drive log (GetLog).
    Log(DriveLog),
    /// No payload (Put, Delete, Noop, errors).
    None,
}
