//! Patch records and their binary framing.
//!
//! A patch is a header plus an opaque body. The engine interprets only the
//! `id` and `previous` header fields; any further headers and the body pass
//! through untouched.
//!
//! On disk and in the coordination service a patch is framed as a
//! big-endian `u32` header length, the postcard-encoded header, and the raw
//! body. The fixed prefix lets recovery read headers without touching
//! bodies.

use std::{
    collections::BTreeMap,
    io::{Read, Write},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{PatchId, Version};

/// Headers larger than this are treated as corrupt rather than read.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// The interpreted and pass-through headers of a [`Patch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    /// Unique identifier of this patch.
    pub id: PatchId,
    /// Id of the patch this one follows. Absent only for the very first
    /// patch in a log.
    pub previous: Option<PatchId>,
    /// Application headers the engine carries through uninterpreted.
    pub extra: BTreeMap<String, String>,
}

impl PatchHeader {
    /// Create a header with no pass-through entries.
    pub fn new(id: PatchId, previous: Option<PatchId>) -> Self {
        PatchHeader {
            id,
            previous,
            extra: BTreeMap::new(),
        }
    }

    /// Read a framed header, leaving the reader positioned at the body.
    pub fn read_from(reader: &mut impl Read) -> Result<Self, DecodeError> {
        let mut len_bytes = [0u8; 4];
        reader
            .read_exact(&mut len_bytes)
            .map_err(|_| DecodeError::Truncated)?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_HEADER_SIZE {
            return Err(DecodeError::HeaderTooLarge(len));
        }
        let mut header_bytes = vec![0u8; len];
        reader
            .read_exact(&mut header_bytes)
            .map_err(|_| DecodeError::Truncated)?;
        Ok(postcard::from_bytes(&header_bytes)?)
    }
}

/// One unit of change appended to a patch log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    header: PatchHeader,
    body: Bytes,
}

impl Patch {
    /// Create a patch from a header and an opaque body.
    pub fn new(header: PatchHeader, body: impl Into<Bytes>) -> Self {
        Patch {
            header,
            body: body.into(),
        }
    }

    /// The id of this patch.
    pub fn id(&self) -> PatchId {
        self.header.id
    }

    /// The id of the patch this one follows, if any.
    pub fn previous(&self) -> Option<PatchId> {
        self.header.previous
    }

    /// The full header.
    pub fn header(&self) -> &PatchHeader {
        &self.header
    }

    /// The opaque body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Write the framed patch.
    ///
    /// Fails if the header would exceed the size [`PatchHeader::read_from`]
    /// accepts.
    pub fn write_to(&self, writer: &mut impl Write) -> std::io::Result<()> {
        let header = postcard::to_stdvec(&self.header)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        if header.len() > MAX_HEADER_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "patch header exceeds the maximum size",
            ));
        }
        writer.write_all(&u32::to_be_bytes(header.len() as u32))?;
        writer.write_all(&header)?;
        writer.write_all(&self.body)?;
        Ok(())
    }

    /// Encode the framed patch into a byte vector.
    pub fn to_vec(&self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Decode a framed patch. The body is everything after the header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = bytes;
        let header = PatchHeader::read_from(&mut reader)?;
        Ok(Patch {
            header,
            body: Bytes::copy_from_slice(reader),
        })
    }
}

/// The bytes are not a valid framed patch.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The input ended before the framed header was complete.
    #[error("patch truncated before the end of its header")]
    Truncated,
    /// The header length prefix exceeds the allowed maximum.
    #[error("patch header of {0} bytes exceeds the maximum")]
    HeaderTooLarge(usize),
    /// The header bytes did not decode.
    #[error("malformed patch header")]
    Header(#[from] postcard::Error),
}

/// The index record of one committed patch: its version, id, and the id it
/// chains from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The version assigned on append.
    pub version: Version,
    /// The id of the committed patch.
    pub id: PatchId,
    /// The id of the preceding patch. Absent for the first entry of a full
    /// log; for a truncated log it may name an entry outside the retained
    /// range.
    pub previous: Option<PatchId>,
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_patch() -> Patch {
        let mut rng = rand::thread_rng();
        let mut header = PatchHeader::new(PatchId::random(&mut rng), None);
        header.extra.insert("origin".into(), "test-node".into());
        Patch::new(header, Bytes::from_static(b"A <b> <c> ."))
    }

    #[test]
    fn test_frame_roundtrip() {
        let patch = sample_patch();
        let bytes = patch.to_vec().unwrap();
        let decoded = Patch::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, patch);
        assert_eq!(decoded.body(), patch.body());
        assert_eq!(decoded.header().extra["origin"], "test-node");
    }

    #[test]
    fn test_header_only_read() {
        let patch = sample_patch();
        let bytes = patch.to_vec().unwrap();
        let mut reader = Cursor::new(&bytes);
        let header = PatchHeader::read_from(&mut reader).unwrap();
        assert_eq!(&header, patch.header());
        // the body is still unread
        assert_eq!(
            bytes.len() as u64 - reader.position(),
            patch.body().len() as u64
        );
    }

    #[test]
    fn test_truncated() {
        let patch = sample_patch();
        let bytes = patch.to_vec().unwrap();
        assert!(matches!(
            PatchHeader::read_from(&mut &bytes[..3]),
            Err(DecodeError::Truncated)
        ));
        assert!(matches!(
            PatchHeader::read_from(&mut &bytes[..10]),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut bytes = u32::to_be_bytes(u32::MAX).to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            Patch::from_bytes(&bytes),
            Err(DecodeError::HeaderTooLarge(_))
        ));
    }

    #[test]
    fn test_empty_body() {
        let mut rng = rand::thread_rng();
        let patch = Patch::new(
            PatchHeader::new(PatchId::random(&mut rng), Some(PatchId::random(&mut rng))),
            Bytes::new(),
        );
        let decoded = Patch::from_bytes(&patch.to_vec().unwrap()).unwrap();
        assert!(decoded.body().is_empty());
        assert_eq!(decoded.previous(), patch.previous());
    }
}
