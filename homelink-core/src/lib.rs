#![deny(missing_docs, clippy::unwrap_used)]
//! Cryptographic engine of the homelink transport.
//!
//! Three concerns live here, shared verbatim by the server and the client
//! library so the two sides cannot drift apart:
//!
//! * [`crypto`] – XSalsa20-Poly1305 secretbox primitives, nonce generation,
//!   and the fixed mapping from the SRP shared secret to the 32-byte
//!   transport key (SHA-512, truncated). The mapping must match on both
//!   sides byte-for-byte; it is locked down with a test vector.
//! * [`envelope`] – sealing and opening of the versioned binary envelope
//!   that carries every post-authentication frame, including the gzip
//!   compressed JSON format.
//! * [`srp`] – SRP-6a over the RFC 5054 2048-bit group (`g = 2`, SHA-256),
//!   both the server and client halves, plus the registration helpers that
//!   turn a password into a salt/verifier pair.

pub mod crypto;
pub mod envelope;
pub mod srp;

pub use crypto::SessionKey;
