//! SRP handshake messages.
//!
//! These are the only plaintext JSON frames a connection ever carries; they
//! are sent as WebSocket text frames before authentication. All bignums
//! (`A`, `B`, `M1`, `M2`, salt, verifier) travel as hex strings, and the
//! resume proof is a hex-encoded binary envelope sealed with the stored
//! session key.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handshake messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientHandshake {
    /// Opens a fresh SRP-6a handshake for `identity`.
    #[serde(rename_all = "camelCase")]
    SrpHello {
        /// The username to authenticate as.
        identity: String,
        /// Opaque browser profile identifier, if the client has one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        browser_profile_id: Option<String>,
        /// Free-form metadata about the connecting origin.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin_metadata: Option<serde_json::Value>,
    },
    /// Resumes a previously established session without a password.
    #[serde(rename_all = "camelCase")]
    SrpResume {
        /// The username the session belongs to.
        identity: String,
        /// The resumable session id issued at handshake time.
        session_id: Uuid,
        /// Hex-encoded envelope over `{"timestamp": <now ms>}`, sealed with
        /// the stored session key.
        proof: String,
    },
    /// The client ephemeral and proof, answering the server challenge.
    SrpProof {
        /// Client public ephemeral `A`, hex.
        #[serde(rename = "A")]
        a: String,
        /// Client proof `M1`, hex SHA-256 digest.
        #[serde(rename = "M1")]
        m1: String,
    },
}

/// Plaintext of the resume proof envelope: the current wall clock in
/// milliseconds. Freshness (±5 min) is the replay protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeProof {
    /// Milliseconds since the Unix epoch at proof creation.
    pub timestamp: u64,
}

/// Reasons a resume attempt is rejected. Reported in-band, not as a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeFailure {
    /// The session exceeded its TTL.
    Expired,
    /// No session with that id exists.
    Unknown,
    /// The proof envelope did not decrypt, or its timestamp was stale.
    BadProof,
}

/// Handshake messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerHandshake {
    /// The SRP challenge answering `srp_hello`.
    SrpServerChallenge {
        /// The user's salt, hex.
        salt: String,
        /// Server public ephemeral `B = kv + g^b mod N`, hex.
        #[serde(rename = "B")]
        b: String,
    },
    /// Successful verification of the client proof.
    #[serde(rename_all = "camelCase")]
    SrpServerVerify {
        /// Server proof `M2 = H(A ‖ M1 ‖ K)`, hex.
        #[serde(rename = "M2")]
        m2: String,
        /// The freshly issued resumable session id.
        session_id: Uuid,
    },
    /// Successful session resume.
    #[serde(rename_all = "camelCase")]
    SrpSessionResumed {
        /// The id of the resumed session.
        session_id: Uuid,
    },
    /// Resume rejected. The client may fall back to `srp_hello` on the same
    /// socket; in resume-only mode this is fatal.
    SrpSessionInvalid {
        /// Why the resume was rejected.
        reason: ResumeFailure,
    },
    /// Handshake-level failure (unknown identity, malformed message).
    SrpError {
        /// Generic description. Never distinguishes unknown users from wrong
        /// passwords.
        message: String,
    },
}
