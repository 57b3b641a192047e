#![deny(missing_docs, clippy::unwrap_used)]
//! Client library for the homelink secure multiplexed transport.
//!
//! Most integrations need three steps: open a [`Transport`] (directly to the
//! server or through the pairing relay), establish a [`SecureChannel`] with
//! a password login or a stored-session resume, and then issue requests,
//! subscriptions and uploads over it. Everything on the socket after
//! authentication is an end-to-end encrypted envelope; a relay in the middle
//! sees only ciphertext.
//!
//! The channel owns a driver task that correlates responses to requests,
//! fans events out to subscription streams, and tracks upload
//! acknowledgments. Dropping the channel (or the peer closing) fails every
//! outstanding request with a uniform error.

use homelink_core::envelope::EnvelopeError;
use homelink_core::srp::SrpError;
use homelink_types::handshake::ResumeFailure;
use homelink_types::relay::RelayErrorReason;
use tokio_tungstenite::tungstenite;

mod channel;
mod session;
mod transport;

pub use channel::{
    EventMessage, Response, SecureChannel, Subscription, UploadMeta, UploadOutcome,
};
pub use session::{SessionCache, StoredSession};
pub use transport::Transport;

/// Errors returned by the homelink client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server sent an unexpected message (either message type or a frame
    /// that is not `Text`/`Binary`/`Close`).
    #[error("Unexpected msg")]
    UnexpectedMsg,
    /// The server reported a handshake failure in-band.
    #[error("Server returned an error: {0}")]
    ServerError(String),
    /// The peer closed the connection without an application close code.
    #[error("Endpoint closed connection")]
    Eof,
    /// The peer closed the connection with an application close code.
    #[error("connection closed with code {code}: {reason}")]
    Closed {
        /// The WebSocket close code.
        code: u16,
        /// The close reason text.
        reason: String,
    },
    /// A session resume was rejected. Fatal when running resume-only; clear
    /// the stored session and fall back to a password login.
    #[error("session resume rejected: {0:?}")]
    SessionInvalid(ResumeFailure),
    /// The pairing relay refused to connect us.
    #[error("relay rejected pairing: {0:?}")]
    RelayRejected(RelayErrorReason),
    /// A request did not complete within the client deadline.
    #[error("request timed out")]
    Timeout,
    /// The server reported an upload failure.
    #[error("upload failed: {0}")]
    Upload(String),
    /// The channel driver is gone (connection already closed).
    #[error("channel closed")]
    ChannelClosed,
    /// SRP-level failure (bad hex, proof mismatch).
    #[error(transparent)]
    Srp(#[from] SrpError),
    /// An envelope could not be sealed or opened.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// Filesystem failure of the session cache.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wrapping inner tungstenite error.
    #[error(transparent)]
    WsError(#[from] tungstenite::Error),
}
