//! Message envelopes on the drive connection.
//!
//! Every serialized message travels inside an envelope sealed by a
//! trailing CRC32, the same end-of-record checksum discipline the drives
//! apply to stored values:
//!
//! ```text
//! [preamble:2B][revision:1B][payload_len:u32 LE][payload][crc32:u32 LE]
//! ```
//!
//! The trailer covers everything before it, so a corrupted length or
//! revision byte is caught as reliably as a corrupted payload. All
//! integers are little-endian. Decoding is stateful: a connection owns
//! one [`EnvelopeDecoder`], feeds it raw socket bytes and takes complete
//! payloads out as they become available.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{WireError, WireResult};

/// First two bytes of every envelope: "sd" (shoal drive).
pub const PREAMBLE: [u8; 2] = *b"sd";

/// Current wire revision. Bumped on any incompatible layout change.
pub const WIRE_REVISION: u8 = 1;

/// Fixed head: preamble + revision + payload length.
const HEAD_LEN: usize = 2 + 1 + 4;

/// Bytes an envelope adds around its payload (head + CRC trailer).
pub const ENVELOPE_OVERHEAD: usize = HEAD_LEN + 4;

/// Largest accepted payload. A payload carries at most one shard record
/// (bounded by the drive's value limit) plus version and tag overhead,
/// so this leaves generous headroom.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Wraps `payload` into a sealed envelope ready for the socket.
pub fn seal(payload: &[u8]) -> WireResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut wire = Vec::with_capacity(ENVELOPE_OVERHEAD + payload.len());
    wire.extend_from_slice(&PREAMBLE);
    wire.push(WIRE_REVISION);
    wire.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    wire.extend_from_slice(payload);
    let crc = crc32fast::hash(&wire);
    wire.extend_from_slice(&crc.to_le_bytes());
    Ok(wire)
}

/// Incremental envelope decoder for one connection's byte stream.
///
/// Feed it whatever the socket produced, then drain complete payloads.
/// An error means the stream is corrupt beyond recovery; the connection
/// must be torn down, since resynchronization inside a byte stream is
/// not possible.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buf: BytesMut,
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed as a complete envelope.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Takes the next complete payload out of the stream.
    ///
    /// Returns `Ok(None)` until a whole envelope has been fed. Nothing
    /// is consumed for an incomplete envelope, so feeding one byte at a
    /// time works.
    pub fn next_payload(&mut self) -> WireResult<Option<Bytes>> {
        if self.buf.len() < HEAD_LEN {
            return Ok(None);
        }

        if self.buf[..2] != PREAMBLE {
            return Err(WireError::BadPreamble {
                found: [self.buf[0], self.buf[1]],
            });
        }
        if self.buf[2] != WIRE_REVISION {
            return Err(WireError::UnsupportedRevision(self.buf[2]));
        }

        let payload_len = u32::from_le_bytes(
            self.buf[3..HEAD_LEN]
                .try_into()
                .expect("length field is four bytes"),
        ) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let sealed_len = HEAD_LEN + payload_len;
        let total_len = sealed_len + 4;
        if self.buf.len() < total_len {
            return Ok(None);
        }

        let expected = u32::from_le_bytes(
            self.buf[sealed_len..total_len]
                .try_into()
                .expect("trailer is four bytes"),
        );
        let actual = crc32fast::hash(&self.buf[..sealed_len]);
        if expected != actual {
            return Err(WireError::ChecksumMismatch { expected, actual });
        }

        let mut envelope = self.buf.split_to(total_len);
        envelope.advance(HEAD_LEN);
        envelope.truncate(payload_len);
        Ok(Some(envelope.freeze()))
    }
}
