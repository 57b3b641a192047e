//! Errors a websocket connection may encounter, and their mapping onto
//! close frames with the transport's close codes.

use std::io::ErrorKind;

use axum::extract::ws::CloseFrame;
use tracing::instrument;
use tungstenite::error::ProtocolError;
use uuid::Uuid;

use homelink_types::close_codes;

/// All errors that may occur on a live connection.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error(transparent)]
    Axum(#[from] axum::Error),
    /// Unauthenticated peer sent something that is not a handshake message.
    #[error("authentication required")]
    AuthRequired,
    /// SRP authentication failed: unknown identity, proof mismatch, or bad
    /// client ephemeral. One shared variant so every rejection carries the
    /// same close code and reason; the wire never reveals which case it was.
    #[error("invalid proof")]
    InvalidProof,
    /// Server-side failure while completing the handshake (corrupt stored
    /// credential, session persistence).
    #[error("internal error: {0}")]
    Internal(String),
    /// Envelope parse/decrypt failure, or a plaintext frame after auth.
    #[error("envelope error: {0}")]
    Envelope(String),
    /// Out-of-order upload chunk for {0}.
    #[error("upload {0} out of order")]
    UploadOutOfOrder(Uuid),
    /// Reuse of an upload id within one connection.
    #[error("upload {0} already exists")]
    DuplicateUpload(Uuid),
    /// Unsubscribe of an id that was never subscribed.
    #[error("unknown subscription {0}")]
    UnknownSubscription(Uuid),
    /// Reuse of a subscription id within one connection lifetime.
    #[error("subscription {0} already used")]
    DuplicateSubscription(Uuid),
    /// The server is shutting down.
    #[error("server shutting down")]
    GoingAway,
}

impl Error {
    /// Transforms the error into a close frame if one should be sent.
    #[instrument(level = "debug", skip_all)]
    pub(crate) fn into_close_frame(self) -> Option<CloseFrame> {
        tracing::debug!("{self:?}");
        match self {
            Error::ConnectionClosed => {
                // nothing to do here
                None
            }
            Error::Axum(axum_error) => {
                // try down casting if close-without-handshake
                let inner = axum_error.into_inner();
                if let Some(tungstenite::Error::Protocol(
                    ProtocolError::ResetWithoutClosingHandshake,
                )) = inner.downcast_ref()
                {
                    tracing::trace!("nothing to do client closed session (tungstenite error)");
                    None
                } else if let Some(io_err) = inner.downcast_ref::<std::io::Error>()
                    && io_err.kind() == ErrorKind::ConnectionReset
                {
                    tracing::trace!("nothing to do client closed session (Os error)");
                    None
                } else {
                    Some(CloseFrame {
                        code: axum::extract::ws::close_code::ERROR,
                        reason: "unexpected error".into(),
                    })
                }
            }
            Error::AuthRequired => Some(CloseFrame {
                code: close_codes::AUTH_REQUIRED,
                reason: "Authentication required".into(),
            }),
            Error::InvalidProof => Some(CloseFrame {
                code: close_codes::INVALID_PROOF,
                reason: "invalid_proof".into(),
            }),
            Error::Internal(_) => Some(CloseFrame {
                code: axum::extract::ws::close_code::ERROR,
                reason: "unexpected error".into(),
            }),
            Error::Envelope(_) => Some(CloseFrame {
                code: close_codes::INVALID_ENVELOPE,
                reason: "invalid envelope".into(),
            }),
            Error::UploadOutOfOrder(_) => Some(CloseFrame {
                code: close_codes::PROTOCOL_VIOLATION,
                reason: "upload_out_of_order".into(),
            }),
            Error::DuplicateUpload(_) => Some(CloseFrame {
                code: close_codes::PROTOCOL_VIOLATION,
                reason: "duplicate_upload".into(),
            }),
            Error::UnknownSubscription(_) => Some(CloseFrame {
                code: close_codes::PROTOCOL_VIOLATION,
                reason: "unknown_subscription".into(),
            }),
            Error::DuplicateSubscription(_) => Some(CloseFrame {
                code: close_codes::PROTOCOL_VIOLATION,
                reason: "duplicate_subscription".into(),
            }),
            Error::GoingAway => Some(CloseFrame {
                code: close_codes::GOING_AWAY,
                reason: "server shutting down".into(),
            }),
        }
    }
}
