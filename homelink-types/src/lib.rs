#![deny(missing_docs)]
//! Wire type definitions for the homelink transport.
//!
//! This crate groups together the message structures exchanged between the
//! homelink server, the client library and the pairing relay. It provides:
//!
//! * The binary envelope layout carrying every post-authentication frame
//!   (see [`envelope`] module).
//! * The SRP handshake messages, the only plaintext JSON permitted on a
//!   connection (see [`handshake`] module).
//! * The application protocol multiplexing requests, subscriptions and
//!   uploads (see [`messages`] module).
//! * The control frames understood by the pairing relay (see [`relay`]
//!   module).
//!
//! Both halves of the transport depend on this crate alone for their wire
//! contract; the round-trip tests at this boundary are the compatibility
//! suite for the protocol.

pub mod envelope;
pub mod handshake;
pub mod messages;
pub mod relay;

/// Application-defined WebSocket close codes carried on the close frame.
pub mod close_codes {
    /// A post-auth operation was attempted on an unauthenticated connection.
    ///
    /// Non-retryable: the client must clear resumable state and run a full
    /// handshake next time.
    pub const AUTH_REQUIRED: u16 = 4001;
    /// The SRP client proof did not verify (or the client ephemeral was bad).
    pub const INVALID_PROOF: u16 = 4002;
    /// An envelope failed to parse or decrypt, or a plaintext frame arrived
    /// after authentication.
    ///
    /// Non-retryable: the client must clear resumable state and run a full
    /// handshake next time.
    pub const INVALID_ENVELOPE: u16 = 4003;
    /// Protocol violation: out-of-order upload chunk, duplicate upload id, or
    /// unsubscribe of an unknown subscription.
    pub const PROTOCOL_VIOLATION: u16 = 4005;
    /// The handshake did not reach the authenticated state within the
    /// deadline.
    pub const HANDSHAKE_TIMEOUT: u16 = 4008;
    /// The server is shutting down. Retryable.
    pub const GOING_AWAY: u16 = 4009;
}

#[cfg(test)]
mod tests {
    use super::close_codes;

    #[test]
    fn close_codes_are_stable() {
        assert_eq!(close_codes::AUTH_REQUIRED, 4001);
        assert_eq!(close_codes::INVALID_PROOF, 4002);
        assert_eq!(close_codes::INVALID_ENVELOPE, 4003);
        assert_eq!(close_codes::PROTOCOL_VIOLATION, 4005);
        assert_eq!(close_codes::HANDSHAKE_TIMEOUT, 4008);
        assert_eq!(close_codes::GOING_AWAY, 4009);
    }
}
