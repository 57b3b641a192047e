//! Pairing relay control frames.
//!
//! The relay speaks only these frames, all as plaintext JSON text frames.
//! The first frame on a socket selects its role; after a successful pairing
//! the relay copies every frame verbatim between the two sockets and never
//! interprets contents again.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames sent *to* the relay by either role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayRequest {
    /// Registers this socket as the server for `username`.
    ///
    /// The optional `proof` authenticates the server to the relay only; the
    /// end-to-end key is unaffected.
    ServerRegister {
        /// Username to register under.
        username: String,
        /// Relay-level registration proof, if the relay demands one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proof: Option<String>,
    },
    /// Asks the relay to pair this socket with the server for `username`.
    ClientConnect {
        /// Username to pair with.
        username: String,
    },
    /// The registered server acknowledges a [`RelayReply::ServerPaired`]
    /// notification. Must arrive within the pairing deadline.
    #[serde(rename_all = "camelCase")]
    ServerPairedAck {
        /// Echo of the id from the pairing notification.
        client_id: Uuid,
    },
}

/// Reasons the relay rejects a pairing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayErrorReason {
    /// No server is registered under that username.
    UnknownUsername,
    /// The server is already paired with another live client.
    ServerBusy,
    /// The registered server did not acknowledge the pairing in time.
    ServerOffline,
    /// The per-username pairing budget is exhausted.
    RateLimited,
}

/// Frames sent *by* the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayReply {
    /// The pairing succeeded; from now on every frame is piped verbatim.
    ClientConnected,
    /// The pairing failed; the socket is closed afterwards.
    ClientError {
        /// Why the pairing failed.
        reason: RelayErrorReason,
    },
    /// Tells the registered server a client wants to pair.
    #[serde(rename_all = "camelCase")]
    ServerPaired {
        /// Relay-assigned id of the pairing, to be echoed in the ACK.
        client_id: Uuid,
    },
}
