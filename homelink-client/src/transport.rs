//! Websocket transport for the client.
//!
//! The secure channel runs over any duplex frame stream; both ways of
//! reaching a server produce the same stream type, so the transport is one
//! thin wrapper with two constructors. The relay path performs the
//! `client_connect`/`client_connected` pairing exchange and then hands back
//! the very same socket: from that point on the relay pipes frames blindly
//! and the transport is indistinguishable from a direct connection.
//!
//! Closing handshakes are best-effort, matching how conservative the rest of
//! the session handling is: if sending a `Close` frame fails we simply drop
//! the connection.

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use homelink_types::relay::{RelayReply, RelayRequest};

use crate::Error;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected, not yet authenticated, duplex frame stream.
pub struct Transport {
    pub(crate) stream: WsStream,
}

impl Transport {
    /// Connects directly to a homelink server websocket URL.
    pub async fn connect_direct(url: &str) -> Result<Self, Error> {
        tracing::trace!("> connecting to {url}..");
        let (stream, _) = connect_async(url).await?;
        Ok(Self { stream })
    }

    /// Connects through a pairing relay to the server registered under
    /// `username`.
    ///
    /// Sends `client_connect` and waits for `client_connected`; afterwards
    /// the socket is a pre-wired byte pipe to the real server and the normal
    /// handshake runs end-to-end through it.
    pub async fn connect_via_relay(relay_url: &str, username: &str) -> Result<Self, Error> {
        tracing::trace!("> pairing via {relay_url} as {username}..");
        let (mut stream, _) = connect_async(relay_url).await?;
        let connect = RelayRequest::ClientConnect {
            username: username.to_owned(),
        };
        stream
            .send(Message::text(
                serde_json::to_string(&connect).expect("relay frames serialize"),
            ))
            .await?;

        loop {
            match stream.next().await.ok_or(Error::Eof)?? {
                Message::Text(text) => {
                    match serde_json::from_slice::<RelayReply>(text.as_bytes()) {
                        Ok(RelayReply::ClientConnected) => return Ok(Self { stream }),
                        Ok(RelayReply::ClientError { reason }) => {
                            return Err(Error::RelayRejected(reason));
                        }
                        Ok(RelayReply::ServerPaired { .. }) | Err(_) => {
                            return Err(Error::UnexpectedMsg);
                        }
                    }
                }
                Message::Close(frame) => return Err(close_error(frame)),
                Message::Ping(_) | Message::Pong(_) => {}
                _ => return Err(Error::UnexpectedMsg),
            }
        }
    }

    /// Sends one text frame.
    pub(crate) async fn send_text(&mut self, text: String) -> Result<(), Error> {
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    /// Reads the next text frame, surfacing close frames as errors.
    pub(crate) async fn recv_text(&mut self) -> Result<String, Error> {
        loop {
            match self.stream.next().await.ok_or(Error::Eof)?? {
                Message::Text(text) => return Ok(text.to_string()),
                Message::Close(frame) => return Err(close_error(frame)),
                Message::Ping(_) | Message::Pong(_) => {}
                _ => return Err(Error::UnexpectedMsg),
            }
        }
    }
}

pub(crate) fn close_error(
    frame: Option<tokio_tungstenite::tungstenite::protocol::CloseFrame>,
) -> Error {
    match frame {
        Some(frame) => Error::Closed {
            code: frame.code.into(),
            reason: frame.reason.to_string(),
        },
        None => Error::Eof,
    }
}
