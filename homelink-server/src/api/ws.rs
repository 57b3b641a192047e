//! The websocket endpoint.
//!
//! One route serves every connection. The upgrade applies the configured
//! `max_message_size`; the handshake phase is wrapped in the handshake
//! timeout and any failure there is mapped to a close frame before the
//! socket is dropped. Once authenticated, the connection module owns the
//! socket until it closes.

use std::time::Duration;

use axum::{
    Router,
    extract::{
        WebSocketUpgrade,
        ws::{self, CloseFrame},
    },
    routing::any,
};
use tokio_util::sync::CancellationToken;

use homelink_types::close_codes;

use crate::connection::{self, ConnectionServices};
use crate::metrics::{METRICS_ID_CONNECTIONS_OPEN, METRICS_ID_HANDSHAKES_FAILED};

struct WebSocketArgs {
    ws: WebSocketUpgrade,
    services: ConnectionServices,
    max_message_size: usize,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
}

async fn ws(args: WebSocketArgs) -> axum::response::Response {
    args.ws
        .max_message_size(args.max_message_size)
        .on_failed_upgrade(|err| {
            tracing::warn!("could not establish websocket connection: {err:?}");
        })
        .on_upgrade(move |mut socket| async move {
            ::metrics::gauge!(METRICS_ID_CONNECTIONS_OPEN).increment(1);
            let auth = match tokio::time::timeout(
                args.handshake_timeout,
                connection::handshake(&mut socket, &args.services),
            )
            .await
            {
                Ok(Ok(auth)) => Some(auth),
                Ok(Err(err)) => {
                    if let Some(frame) = err.into_close_frame() {
                        let _ = socket.send(ws::Message::Close(Some(frame))).await;
                    }
                    None
                }
                Err(_) => {
                    ::metrics::counter!(METRICS_ID_HANDSHAKES_FAILED).increment(1);
                    let _ = socket
                        .send(ws::Message::Close(Some(CloseFrame {
                            code: close_codes::HANDSHAKE_TIMEOUT,
                            reason: "handshake_timeout".into(),
                        })))
                        .await;
                    None
                }
            };
            if let Some(auth) = auth {
                connection::run(socket, auth, args.services, args.shutdown).await;
            }
            ::metrics::gauge!(METRICS_ID_CONNECTIONS_OPEN).decrement(1);
        })
}

/// Creates a `Router` with the single `/ws` transport route.
///
/// Clients upgrade via the websocket upgrade protocol; connections are
/// accepted with `any` so both HTTP/1.1 and HTTP/2 upgrades work.
pub(crate) fn routes(
    services: ConnectionServices,
    max_message_size: usize,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> Router {
    Router::new().route(
        "/ws",
        any(move |websocket_upgrade| {
            ws(WebSocketArgs {
                ws: websocket_upgrade,
                services,
                max_message_size,
                handshake_timeout,
                shutdown,
            })
        }),
    )
}
