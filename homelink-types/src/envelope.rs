//! Binary envelope layout.
//!
//! Every frame after authentication is an envelope:
//! `version(1) ‖ nonce(24) ‖ ciphertext`. The ciphertext decrypts to
//! `format(1) ‖ payload`, where the format byte selects JSON, an upload
//! chunk, or gzip-compressed JSON. This module only knows the layout;
//! sealing and opening live in `homelink-core` next to the cipher.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version byte leading every envelope. Distinct from the inner format byte.
pub const ENVELOPE_VERSION: u8 = 0x01;
/// Length of the XSalsa20-Poly1305 nonce.
pub const NONCE_LEN: usize = 24;
/// Length of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;
/// Shortest well-formed envelope: version, nonce and the tag of an empty
/// plaintext.
pub const MIN_FRAME_LEN: usize = 1 + NONCE_LEN + TAG_LEN;

/// Header prefix of an upload chunk payload: `uploadId(16) ‖ offset(8)`.
pub const CHUNK_HEADER_LEN: usize = 16 + 8;

/// Errors produced while parsing wire frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The frame is shorter than the minimum envelope.
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),
    /// The leading version byte is not [`ENVELOPE_VERSION`].
    #[error("unknown envelope version {0:#04x}")]
    UnknownVersion(u8),
    /// The inner format byte is not a known [`PayloadFormat`].
    #[error("unknown payload format {0:#04x}")]
    UnknownFormat(u8),
    /// An upload chunk payload is shorter than its fixed header.
    #[error("chunk payload too short: {0} bytes")]
    ChunkTooShort(usize),
    /// The plaintext of an envelope was empty (no format byte).
    #[error("empty envelope plaintext")]
    EmptyPlaintext,
}

/// The first plaintext byte inside an envelope, selecting the payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PayloadFormat {
    /// UTF-8 JSON application message.
    Json,
    /// Upload chunk: `uploadId(16) ‖ offset(u64 BE) ‖ bytes`. Never
    /// compressed.
    UploadChunk,
    /// Gzip-compressed UTF-8 JSON application message.
    CompressedJson,
}

impl From<PayloadFormat> for u8 {
    fn from(value: PayloadFormat) -> Self {
        match value {
            PayloadFormat::Json => 0x01,
            PayloadFormat::UploadChunk => 0x02,
            PayloadFormat::CompressedJson => 0x03,
        }
    }
}

impl TryFrom<u8> for PayloadFormat {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PayloadFormat::Json),
            0x02 => Ok(PayloadFormat::UploadChunk),
            0x03 => Ok(PayloadFormat::CompressedJson),
            other => Err(WireError::UnknownFormat(other)),
        }
    }
}

/// A parsed envelope frame. The ciphertext is still sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The 24-byte nonce, fresh per envelope.
    pub nonce: [u8; NONCE_LEN],
    /// The secretbox output (`tag(16) ‖ cipher`).
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Serializes the envelope to its wire form `version ‖ nonce ‖ ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + NONCE_LEN + self.ciphertext.len());
        out.push(ENVELOPE_VERSION);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parses an envelope from its wire form.
    ///
    /// Rejects frames shorter than [`MIN_FRAME_LEN`] and unknown versions.
    pub fn from_bytes(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(WireError::FrameTooShort(frame.len()));
        }
        if frame[0] != ENVELOPE_VERSION {
            return Err(WireError::UnknownVersion(frame[0]));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&frame[1..1 + NONCE_LEN]);
        Ok(Self {
            nonce,
            ciphertext: frame[1 + NONCE_LEN..].to_vec(),
        })
    }
}

/// Decoded upload chunk payload (format `0x02`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    /// The client-chosen 128-bit upload id.
    pub upload_id: Uuid,
    /// Offset of `data` within the file. Must equal the bytes received so
    /// far; the store is append-only.
    pub offset: u64,
    /// The chunk bytes.
    pub data: Vec<u8>,
}

impl ChunkPayload {
    /// Encodes the chunk to `uploadId(16) ‖ offset(u64 BE) ‖ data`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + self.data.len());
        out.extend_from_slice(self.upload_id.as_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Decodes a chunk payload, rejecting truncated headers.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < CHUNK_HEADER_LEN {
            return Err(WireError::ChunkTooShort(payload.len()));
        }
        let upload_id = Uuid::from_slice(&payload[..16]).expect("slice is 16 bytes");
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&payload[16..24]);
        Ok(Self {
            upload_id,
            offset: u64::from_be_bytes(offset),
            data: payload[CHUNK_HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope {
            nonce: [7u8; NONCE_LEN],
            ciphertext: vec![0xAA; 40],
        };
        let bytes = envelope.to_bytes();
        assert_eq!(bytes[0], ENVELOPE_VERSION);
        assert_eq!(bytes.len(), 1 + NONCE_LEN + 40);
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn envelope_rejects_short_frames() {
        let err = Envelope::from_bytes(&[ENVELOPE_VERSION; MIN_FRAME_LEN - 1]).unwrap_err();
        assert_eq!(err, WireError::FrameTooShort(MIN_FRAME_LEN - 1));
    }

    #[test]
    fn envelope_rejects_unknown_version() {
        let mut bytes = Envelope {
            nonce: [0u8; NONCE_LEN],
            ciphertext: vec![0; TAG_LEN],
        }
        .to_bytes();
        bytes[0] = 0x02;
        assert_eq!(
            Envelope::from_bytes(&bytes).unwrap_err(),
            WireError::UnknownVersion(0x02)
        );
    }

    #[test]
    fn format_byte_mapping() {
        assert_eq!(u8::from(PayloadFormat::Json), 0x01);
        assert_eq!(u8::from(PayloadFormat::UploadChunk), 0x02);
        assert_eq!(u8::from(PayloadFormat::CompressedJson), 0x03);
        assert_eq!(PayloadFormat::try_from(0x02).unwrap(), PayloadFormat::UploadChunk);
        assert_eq!(
            PayloadFormat::try_from(0x7F).unwrap_err(),
            WireError::UnknownFormat(0x7F)
        );
    }

    #[test]
    fn chunk_round_trip() {
        let chunk = ChunkPayload {
            upload_id: Uuid::new_v4(),
            offset: 65536,
            data: vec![1, 2, 3, 4],
        };
        let bytes = chunk.to_bytes();
        assert_eq!(bytes.len(), CHUNK_HEADER_LEN + 4);
        assert_eq!(&bytes[16..24], &65536u64.to_be_bytes());
        assert_eq!(ChunkPayload::from_bytes(&bytes).unwrap(), chunk);
    }

    #[test]
    fn chunk_rejects_truncated_header() {
        assert_eq!(
            ChunkPayload::from_bytes(&[0u8; CHUNK_HEADER_LEN - 1]).unwrap_err(),
            WireError::ChunkTooShort(CHUNK_HEADER_LEN - 1)
        );
    }

    #[test]
    fn chunk_with_empty_data_is_valid() {
        let chunk = ChunkPayload {
            upload_id: Uuid::nil(),
            offset: 0,
            data: Vec::new(),
        };
        assert_eq!(ChunkPayload::from_bytes(&chunk.to_bytes()).unwrap(), chunk);
    }
}
