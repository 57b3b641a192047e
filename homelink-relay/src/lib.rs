#![deny(missing_docs)]
//! Blind pairing relay for the homelink transport.
//!
//! The relay matches exactly one registered server socket and one client
//! socket per username and thereafter copies every text/binary frame
//! verbatim between the two until either side closes. It neither parses nor
//! stores any piped frame: the end-to-end encryption between browser and
//! server is untouched, the relay sees only ciphertext.
//!
//! One WebSocket URL serves both roles; the first frame on a socket selects
//! it (`server_register` or `client_connect`). Pairing is acknowledged by
//! the server (`server_paired` → `server_paired_ack`) before the client gets
//! its `client_connected`, so a dead uplink is reported as `server_offline`
//! instead of a silent black hole.
//!
//! Per-username flood limits bound pair setups per minute and piped bytes
//! per minute; both are config knobs. The relay applies them by counting
//! frame lengths only, never by inspecting contents.
//!
//! Build the router with [`routes`] and serve it from the hosting
//! application:
//!
//! ```no_run
//! # async fn example(config: homelink_relay::config::RelayConfig) -> eyre::Result<()> {
//! let router = homelink_relay::routes(config);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:9200").await?;
//! axum::serve(listener, router).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::{
        WebSocketUpgrade,
        ws::{self, CloseFrame, Message, WebSocket, close_code},
    },
    routing::any,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::instrument;
use uuid::Uuid;

use homelink_types::relay::{RelayErrorReason, RelayReply, RelayRequest};

pub mod config;
pub mod metrics;

pub use config::RelayConfig;

use crate::metrics::{
    METRICS_ID_RELAY_BYTES, METRICS_ID_RELAY_PIPES, METRICS_ID_RELAY_REJECTED,
    METRICS_ID_RELAY_SERVERS,
};

/// Creates the relay `Router` with its single websocket route.
pub fn routes(config: RelayConfig) -> Router {
    let state = RelayState {
        servers: Arc::new(Mutex::new(HashMap::new())),
        pair_attempts: Arc::new(Mutex::new(HashMap::new())),
        config: Arc::new(config),
    };
    Router::new()
        .route(
            "/ws",
            any(move |websocket_upgrade: WebSocketUpgrade| {
                let state = state.clone();
                let max_message_size = state.config.ws_max_message_size;
                async move {
                    websocket_upgrade
                        .max_message_size(max_message_size)
                        .on_failed_upgrade(|err| {
                            tracing::warn!("could not establish websocket connection: {err:?}");
                        })
                        .on_upgrade(move |socket| handle_socket(socket, state))
                }
            }),
        )
        .layer(TraceLayer::new_for_http())
}

#[derive(Clone)]
struct RelayState {
    servers: Arc<Mutex<HashMap<String, RegisteredServer>>>,
    pair_attempts: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    config: Arc<RelayConfig>,
}

struct RegisteredServer {
    registration_id: Uuid,
    offer_tx: mpsc::Sender<PairingOffer>,
    busy: Arc<AtomicBool>,
    budget: Arc<ByteBudget>,
    cancel: CancellationToken,
}

struct PairingOffer {
    client_id: Uuid,
    ack: oneshot::Sender<()>,
    client_to_server: mpsc::Receiver<Message>,
    server_to_client: mpsc::Sender<Message>,
}

impl RelayState {
    /// Sliding one-minute window of pair setups per username.
    fn allow_pair(&self, username: &str) -> bool {
        let mut attempts = self.pair_attempts.lock();
        let window = attempts.entry(username.to_owned()).or_default();
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|at| now.duration_since(*at) > Duration::from_secs(60))
        {
            window.pop_front();
        }
        if window.len() as u32 >= self.config.pairs_per_minute {
            return false;
        }
        window.push_back(now);
        true
    }
}

/// One-minute byte budget shared by both directions of a pipe.
struct ByteBudget {
    max: u64,
    window: Mutex<(Instant, u64)>,
}

impl ByteBudget {
    fn new(max: u64) -> Self {
        Self {
            max,
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Accounts `len` bytes; `false` once the window's budget is blown.
    fn charge(&self, len: usize) -> bool {
        let mut window = self.window.lock();
        let now = Instant::now();
        if now.duration_since(window.0) >= Duration::from_secs(60) {
            *window = (now, 0);
        }
        window.1 += len as u64;
        ::metrics::counter!(METRICS_ID_RELAY_BYTES).increment(len as u64);
        window.1 <= self.max
    }
}

/// Reads the role-selecting first frame and dispatches the socket.
async fn handle_socket(mut socket: WebSocket, state: RelayState) {
    let role = tokio::time::timeout(state.config.role_timeout, async {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_slice::<RelayRequest>(text.as_bytes()).ok();
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                _ => return None,
            }
        }
    })
    .await;

    match role {
        Ok(Some(RelayRequest::ServerRegister { username, proof: _ })) => {
            server_task(socket, state, username).await;
        }
        Ok(Some(RelayRequest::ClientConnect { username })) => {
            client_task(socket, state, username).await;
        }
        Ok(Some(RelayRequest::ServerPairedAck { .. })) | Ok(None) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "expected role frame".into(),
                })))
                .await;
        }
        Err(_) => {
            tracing::debug!("socket never sent a role frame");
        }
    }
}

/// Lifecycle of a registered server socket: wait for one pairing, serve it,
/// then tear down (the uplink re-registers for the next client).
#[instrument(level = "debug", skip_all, fields(username = %username))]
async fn server_task(mut socket: WebSocket, state: RelayState, username: String) {
    let registration_id = Uuid::new_v4();
    let (offer_tx, mut offer_rx) = mpsc::channel(1);
    let busy = Arc::new(AtomicBool::new(false));
    let budget = Arc::new(ByteBudget::new(state.config.bytes_per_minute));
    let cancel = CancellationToken::new();

    {
        let mut servers = state.servers.lock();
        let previous = servers.insert(
            username.clone(),
            RegisteredServer {
                registration_id,
                offer_tx,
                busy,
                budget: Arc::clone(&budget),
                cancel: cancel.clone(),
            },
        );
        match previous {
            Some(previous) => {
                tracing::debug!("replacing previous registration");
                previous.cancel.cancel();
            }
            None => ::metrics::gauge!(METRICS_ID_RELAY_SERVERS).increment(1),
        }
    }
    tracing::debug!("server registered");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: "registration replaced".into(),
                    })))
                    .await;
                break;
            }
            offer = offer_rx.recv() => {
                let Some(offer) = offer else { break };
                serve_pairing(&mut socket, offer, &budget, state.config.pair_ack_timeout).await;
                break;
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // nothing legitimate to say before a pairing
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let mut servers = state.servers.lock();
    if servers
        .get(&username)
        .is_some_and(|server| server.registration_id == registration_id)
    {
        servers.remove(&username);
        ::metrics::gauge!(METRICS_ID_RELAY_SERVERS).decrement(1);
    }
}

/// Runs the server-side half of a pairing: notify, await the ACK, pipe.
async fn serve_pairing(
    socket: &mut WebSocket,
    offer: PairingOffer,
    budget: &ByteBudget,
    ack_timeout: Duration,
) {
    let PairingOffer {
        client_id,
        ack,
        mut client_to_server,
        server_to_client,
    } = offer;

    let paired = RelayReply::ServerPaired { client_id };
    if send_reply(socket, &paired).await.is_err() {
        return;
    }

    let acked = tokio::time::timeout(ack_timeout, async {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(RelayRequest::ServerPairedAck { client_id: echoed }) =
                        serde_json::from_slice(text.as_bytes())
                        && echoed == client_id
                    {
                        return true;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                _ => return false,
            }
        }
    })
    .await;
    if !matches!(acked, Ok(true)) {
        tracing::debug!("pairing {client_id} not acknowledged");
        return;
    }
    if ack.send(()).is_err() {
        // client gave up while we waited
        return;
    }

    tracing::debug!("pipe {client_id} up");
    ::metrics::gauge!(METRICS_ID_RELAY_PIPES).increment(1);
    let over_budget = pipe(socket, &mut client_to_server, &server_to_client, budget).await;
    ::metrics::gauge!(METRICS_ID_RELAY_PIPES).decrement(1);
    tracing::debug!("pipe {client_id} down");

    let _ = socket
        .send(Message::Close(Some(close_frame_for(over_budget))))
        .await;
}

/// Lifecycle of a client socket: rate-check, find the server, pair, pipe.
#[instrument(level = "debug", skip_all, fields(username = %username))]
async fn client_task(mut socket: WebSocket, state: RelayState, username: String) {
    if !state.allow_pair(&username) {
        reject(&mut socket, RelayErrorReason::RateLimited).await;
        return;
    }

    let server = {
        let servers = state.servers.lock();
        servers.get(&username).map(|server| {
            (
                server.offer_tx.clone(),
                Arc::clone(&server.busy),
                Arc::clone(&server.budget),
            )
        })
    };
    let Some((offer_tx, busy, budget)) = server else {
        reject(&mut socket, RelayErrorReason::UnknownUsername).await;
        return;
    };

    if busy
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        reject(&mut socket, RelayErrorReason::ServerBusy).await;
        return;
    }
    // the flag outlives this task only until the registration dies with us
    let _busy_guard = BusyGuard(busy);

    let client_id = Uuid::new_v4();
    let (ack_tx, ack_rx) = oneshot::channel();
    let (c2s_tx, c2s_rx) = mpsc::channel(32);
    let (s2c_tx, mut s2c_rx) = mpsc::channel(32);
    let offer = PairingOffer {
        client_id,
        ack: ack_tx,
        client_to_server: c2s_rx,
        server_to_client: s2c_tx,
    };
    if offer_tx.send(offer).await.is_err() {
        reject(&mut socket, RelayErrorReason::ServerOffline).await;
        return;
    }
    match tokio::time::timeout(state.config.pair_ack_timeout, ack_rx).await {
        Ok(Ok(())) => {}
        _ => {
            reject(&mut socket, RelayErrorReason::ServerOffline).await;
            return;
        }
    }

    if send_reply(&mut socket, &RelayReply::ClientConnected)
        .await
        .is_err()
    {
        return;
    }
    tracing::debug!("client {client_id} connected");

    let over_budget = pipe_client(&mut socket, &c2s_tx, &mut s2c_rx, &budget).await;
    let _ = socket
        .send(Message::Close(Some(close_frame_for(over_budget))))
        .await;
}

struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Copies frames between the server socket and the client task until either
/// side closes or the byte budget is blown. Returns whether it was blown.
async fn pipe(
    socket: &mut WebSocket,
    inbound: &mut mpsc::Receiver<Message>,
    outbound: &mpsc::Sender<Message>,
    budget: &ByteBudget,
) -> bool {
    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        if !budget.charge(frame_len(&msg)) {
                            return true;
                        }
                        if outbound.send(msg).await.is_err() {
                            return false;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return false,
                    Some(Ok(_)) => {}
                }
            }
            msg = inbound.recv() => {
                match msg {
                    Some(msg) => {
                        if socket.send(msg).await.is_err() {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
        }
    }
}

/// Mirror of [`pipe`] for the client socket.
async fn pipe_client(
    socket: &mut WebSocket,
    outbound: &mpsc::Sender<Message>,
    inbound: &mut mpsc::Receiver<Message>,
    budget: &ByteBudget,
) -> bool {
    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        if !budget.charge(frame_len(&msg)) {
                            return true;
                        }
                        if outbound.send(msg).await.is_err() {
                            return false;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return false,
                    Some(Ok(_)) => {}
                }
            }
            msg = inbound.recv() => {
                match msg {
                    Some(msg) => {
                        if socket.send(msg).await.is_err() {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
        }
    }
}

fn frame_len(msg: &Message) -> usize {
    match msg {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) => bytes.len(),
        _ => 0,
    }
}

fn close_frame_for(over_budget: bool) -> CloseFrame {
    if over_budget {
        CloseFrame {
            code: close_code::POLICY,
            reason: "byte budget exceeded".into(),
        }
    } else {
        CloseFrame {
            code: close_code::NORMAL,
            reason: "pipe closed".into(),
        }
    }
}

async fn reject(socket: &mut WebSocket, reason: RelayErrorReason) {
    ::metrics::counter!(METRICS_ID_RELAY_REJECTED).increment(1);
    tracing::debug!("rejecting pairing: {reason:?}");
    let _ = send_reply(socket, &RelayReply::ClientError { reason }).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "pairing rejected".into(),
        })))
        .await;
}

async fn send_reply(socket: &mut WebSocket, reply: &RelayReply) -> Result<(), axum::Error> {
    let text = serde_json::to_string(reply).expect("relay frames serialize");
    socket.send(ws::Message::text(text)).await
}
