//! Envelope sealing and opening.
//!
//! An envelope carries one encrypted application frame:
//! `0x01 ‖ nonce(24) ‖ secretbox(key, nonce, format ‖ payload)`. Format
//! `0x03` additionally gzips the payload before sealing, so opening returns
//! the logical (uncompressed) payload for every format. Upload chunks are
//! never compressed.

use std::io::{Read as _, Write as _};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use homelink_types::envelope::{Envelope, PayloadFormat, WireError};

use crate::crypto::{self, CryptoError, SessionKey};

/// Errors while sealing or opening an envelope.
///
/// Decode failures carry no partial plaintext.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The frame layout was invalid (length, version, format byte).
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The secretbox layer rejected the frame.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Gzip inflation or deflation of a `0x03` payload failed.
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
}

/// Seals `payload` into a full wire frame under `key`.
///
/// A fresh random nonce is generated per call. For
/// [`PayloadFormat::CompressedJson`] the payload is gzipped before
/// encryption.
pub fn seal(
    key: &SessionKey,
    format: PayloadFormat,
    payload: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let body = match format {
        PayloadFormat::CompressedJson => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload)?;
            encoder.finish()?
        }
        PayloadFormat::Json | PayloadFormat::UploadChunk => payload.to_vec(),
    };

    let mut plaintext = Vec::with_capacity(1 + body.len());
    plaintext.push(u8::from(format));
    plaintext.extend_from_slice(&body);

    let nonce = crypto::generate_nonce();
    let ciphertext = crypto::secretbox_seal(key, &nonce, &plaintext)?;
    Ok(Envelope { nonce, ciphertext }.to_bytes())
}

/// Opens a wire frame, returning the format and the logical payload.
///
/// `0x03` payloads are gunzipped, so `open(seal(k, f, p)) == (f, p)` holds
/// for every format.
pub fn open(key: &SessionKey, frame: &[u8]) -> Result<(PayloadFormat, Vec<u8>), EnvelopeError> {
    let envelope = Envelope::from_bytes(frame)?;
    let plaintext = crypto::secretbox_open(key, &envelope.nonce, &envelope.ciphertext)?;
    let (&format_byte, body) = plaintext
        .split_first()
        .ok_or(WireError::EmptyPlaintext)?;
    let format = PayloadFormat::try_from(format_byte)?;
    let payload = match format {
        PayloadFormat::CompressedJson => {
            let mut decoder = GzDecoder::new(body);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        }
        PayloadFormat::Json | PayloadFormat::UploadChunk => body.to_vec(),
    };
    Ok((format, payload))
}

/// Seals a resume proof over the given wall-clock timestamp (ms), returning
/// the hex-encoded frame carried in `srp_resume`.
pub fn resume_proof_at(key: &SessionKey, timestamp: u64) -> Result<String, EnvelopeError> {
    let payload = serde_json::to_vec(&homelink_types::handshake::ResumeProof { timestamp })
        .expect("proof serializes");
    Ok(hex::encode(seal(key, PayloadFormat::Json, &payload)?))
}

/// Seals a resume proof at the current wall clock.
pub fn resume_proof_now(key: &SessionKey) -> Result<String, EnvelopeError> {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    resume_proof_at(key, now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use homelink_types::envelope::{MIN_FRAME_LEN, NONCE_LEN};
    use rand::RngCore as _;

    fn random_payload(len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut payload);
        payload
    }

    #[test]
    fn round_trip_all_formats() {
        let key = SessionKey::random();
        for format in [
            PayloadFormat::Json,
            PayloadFormat::UploadChunk,
            PayloadFormat::CompressedJson,
        ] {
            for len in [0usize, 1, 64, 4096] {
                let payload = random_payload(len);
                let frame = seal(&key, format, &payload).unwrap();
                let (got_format, got_payload) = open(&key, &frame).unwrap();
                assert_eq!(got_format, format);
                assert_eq!(got_payload, payload);
            }
        }
    }

    #[test]
    fn round_trip_one_mebibyte() {
        let key = SessionKey::random();
        let payload = random_payload(1024 * 1024);
        for format in [PayloadFormat::Json, PayloadFormat::CompressedJson] {
            let frame = seal(&key, format, &payload).unwrap();
            assert_eq!(open(&key, &frame).unwrap(), (format, payload.clone()));
        }
    }

    #[test]
    fn compression_shrinks_redundant_payloads() {
        let key = SessionKey::random();
        let payload = vec![b'a'; 64 * 1024];
        let plain = seal(&key, PayloadFormat::Json, &payload).unwrap();
        let compressed = seal(&key, PayloadFormat::CompressedJson, &payload).unwrap();
        assert!(compressed.len() < plain.len() / 4);
    }

    #[test]
    fn bit_flip_anywhere_fails_decode() {
        let key = SessionKey::random();
        let frame = seal(&key, PayloadFormat::Json, b"{\"x\":1}").unwrap();
        for i in 0..frame.len() {
            for bit in [0x01u8, 0x80u8] {
                let mut tampered = frame.clone();
                tampered[i] ^= bit;
                assert!(
                    open(&key, &tampered).is_err(),
                    "flip at byte {i} bit {bit:#04x} must not decode"
                );
            }
        }
    }

    #[test]
    fn short_frame_rejected() {
        let key = SessionKey::random();
        let err = open(&key, &[0x01; MIN_FRAME_LEN - 1]).unwrap_err();
        assert!(matches!(err, EnvelopeError::Wire(WireError::FrameTooShort(_))));
    }

    #[test]
    fn foreign_key_rejected() {
        let key = SessionKey::random();
        let frame = seal(&key, PayloadFormat::Json, b"{}").unwrap();
        let err = open(&SessionKey::random(), &frame).unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::Crypto(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn nonce_occupies_fixed_region() {
        let key = SessionKey::random();
        let a = seal(&key, PayloadFormat::Json, b"{}").unwrap();
        let b = seal(&key, PayloadFormat::Json, b"{}").unwrap();
        // same payload, different nonces, different frames
        assert_ne!(a[1..1 + NONCE_LEN], b[1..1 + NONCE_LEN]);
        assert_ne!(a, b);
    }
}
