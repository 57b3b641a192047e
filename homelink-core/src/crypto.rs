//! Secretbox primitives and key derivation.
//!
//! Authenticated encryption is XSalsa20-Poly1305 with the libsodium wire
//! layout (`MAC(16) ‖ cipher`). RustCrypto's AEAD produces `cipher ‖ MAC`,
//! so the tag is reordered on both paths to stay compatible with browser
//! NaCl implementations.

use rand::RngCore as _;
use sha2::{Digest as _, Sha512};
use xsalsa20poly1305::XSalsa20Poly1305;
use xsalsa20poly1305::aead::generic_array::GenericArray;
use xsalsa20poly1305::aead::{Aead, KeyInit};
use zeroize::{Zeroize, ZeroizeOnDrop};

use homelink_types::envelope::{NONCE_LEN, TAG_LEN};

/// Size of a secretbox key in bytes.
pub const KEY_LEN: usize = 32;

/// Errors from the secretbox layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Authentication failed during decryption. No plaintext is revealed.
    #[error("decryption failed")]
    DecryptionFailed,
    /// The cipher rejected the input (never expected for valid keys).
    #[error("encryption failed")]
    EncryptionFailed,
    /// Ciphertext shorter than the authentication tag.
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
}

/// The 32-byte symmetric key protecting all post-auth envelopes.
///
/// Zeroized on drop; never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrows the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Generates a random key. Useful for tests and decoy computations.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// Derives the transport key from the raw SRP shared secret.
///
/// The mapping is SHA-512 over the secret bytes, truncated to 32 bytes. It
/// is part of the wire contract and must never change.
pub fn derive_session_key(srp_secret: &[u8]) -> SessionKey {
    let digest = Sha512::digest(srp_secret);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    SessionKey(key)
}

/// Generates a fresh random 24-byte nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypts `plaintext` under `key` and `nonce`.
///
/// Returns `MAC(16) ‖ cipher` (libsodium layout).
pub fn secretbox_seal(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(&key.0));
    let raw = cipher
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    // RustCrypto emits cipher ‖ MAC; reorder to MAC ‖ cipher.
    let ct_len = raw.len() - TAG_LEN;
    let mut out = Vec::with_capacity(raw.len());
    out.extend_from_slice(&raw[ct_len..]);
    out.extend_from_slice(&raw[..ct_len]);
    Ok(out)
}

/// Decrypts `MAC(16) ‖ cipher` under `key` and `nonce`.
pub fn secretbox_open(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
    }
    let (mac, ct) = ciphertext.split_at(TAG_LEN);
    let mut raw = Vec::with_capacity(ciphertext.len());
    raw.extend_from_slice(ct);
    raw.extend_from_slice(mac);
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(&key.0));
    cipher
        .decrypt(GenericArray::from_slice(nonce), raw.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn seal_open_round_trip() {
        let key = SessionKey::random();
        let nonce = generate_nonce();
        let plaintext = b"Hello, World!";

        let sealed = secretbox_seal(&key, &nonce, plaintext).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + TAG_LEN);
        assert_eq!(secretbox_open(&key, &nonce, &sealed).unwrap(), plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let key = SessionKey::random();
        let nonce = generate_nonce();
        let sealed = secretbox_seal(&key, &nonce, b"secret").unwrap();
        assert_eq!(
            secretbox_open(&SessionKey::random(), &nonce, &sealed).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn wrong_nonce_fails() {
        let key = SessionKey::random();
        let sealed = secretbox_seal(&key, &generate_nonce(), b"secret").unwrap();
        assert_eq!(
            secretbox_open(&key, &generate_nonce(), &sealed).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn short_ciphertext_rejected() {
        let key = SessionKey::random();
        let nonce = generate_nonce();
        assert_eq!(
            secretbox_open(&key, &nonce, &[0u8; TAG_LEN - 1]).unwrap_err(),
            CryptoError::CiphertextTooShort(TAG_LEN - 1)
        );
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let key = SessionKey::random();
        let nonce = generate_nonce();
        let sealed = secretbox_seal(&key, &nonce, b"").unwrap();
        assert_eq!(secretbox_open(&key, &nonce, &sealed).unwrap(), b"");
    }

    #[test]
    fn key_derivation_is_fixed() {
        // Locked test vector: SHA-512("homelink")[..32]. A change here breaks
        // wire compatibility with every deployed peer.
        let key = derive_session_key(b"homelink");
        assert_eq!(
            hex::encode(key.as_bytes()),
            "eae5410ee460e320dc62970cf1498fd803d146228f0da7d493c2f41a7243a42b"
        );
        assert_ne!(derive_session_key(b"homelink2"), key);
    }

    #[test]
    fn nonces_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(generate_nonce()));
        }
    }
}
