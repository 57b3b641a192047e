//! Per-socket connection lifecycle.
//!
//! A connection starts in the handshake phase, where only plaintext SRP
//! messages are accepted. Once authenticated, the per-frame handler switches
//! to the envelope decoder and every frame must be a sealed binary envelope.
//!
//! The authenticated phase runs a single writer task over a bounded outbound
//! queue (backpressure: producers await a slot) while the reader dispatches
//! frames in arrival order: requests fan out into bounded concurrent router
//! calls, subscriptions tail the event hub at their own pace, and upload
//! chunks append to the store. Closing the socket tears all of it down
//! deterministically: request tasks are aborted, subscription tasks
//! cancelled, and unpromoted uploads discarded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use homelink_core::crypto::{SessionKey, derive_session_key};
use homelink_core::envelope;
use homelink_core::srp;
use homelink_types::envelope::{ChunkPayload, PayloadFormat};
use homelink_types::handshake::{ClientHandshake, ServerHandshake};
use homelink_types::messages::{AppMessage, Channel};

use crate::api::errors::Error;
use crate::app::{AppRouterService, RouterRequest, RouterResponse};
use crate::config::ServerConfig;
use crate::metrics::{
    METRICS_ID_HANDSHAKES_FAILED, METRICS_ID_HANDSHAKES_OK, METRICS_ID_REQUESTS_INFLIGHT,
    METRICS_ID_RESUMES_FAILED, METRICS_ID_RESUMES_OK,
};
use crate::services::credential_store::CredentialStore;
use crate::services::event_hub::{EventHub, PublishedEvent};
use crate::services::session_store::SessionStore;
use crate::services::upload_store::{PartUpload, UploadStore};

/// Emit `upload_progress` at most once per this many bytes...
const PROGRESS_BYTES: u64 = 64 * 1024;
/// ...and at most once per this interval, whichever is rarer.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Everything a connection needs from the surrounding server.
#[derive(Clone)]
pub(crate) struct ConnectionServices {
    pub credentials: CredentialStore,
    pub sessions: SessionStore,
    pub uploads: UploadStore,
    pub events: EventHub,
    pub router: AppRouterService,
    pub limits: Limits,
}

/// The per-connection knobs derived from [`ServerConfig`].
#[derive(Clone)]
pub(crate) struct Limits {
    pub request_timeout: Duration,
    pub max_inflight_requests: usize,
    pub outbound_queue_depth: usize,
    pub heartbeat_interval: Duration,
    pub compression_threshold: usize,
}

impl From<&ServerConfig> for Limits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            max_inflight_requests: config.max_inflight_requests,
            outbound_queue_depth: config.outbound_queue_depth,
            heartbeat_interval: config.heartbeat_interval,
            compression_threshold: config.compression_threshold,
        }
    }
}

/// Result of a successful handshake.
pub(crate) struct Authenticated {
    pub key: SessionKey,
    pub username: String,
    pub session_id: Uuid,
}

/// Runs the handshake phase on a fresh socket.
///
/// Accepts only plaintext SRP messages; any binary frame or unrecognized
/// text closes with 4001. A rejected resume is reported in-band and the
/// client may fall back to `srp_hello` on the same socket.
#[instrument(level = "debug", skip_all)]
pub(crate) async fn handshake(
    socket: &mut WebSocket,
    services: &ConnectionServices,
) -> Result<Authenticated, Error> {
    let mut pending: Option<(String, srp::ServerHandshake)> = None;
    loop {
        let msg = socket.recv().await.ok_or(Error::ConnectionClosed)??;
        match msg {
            Message::Text(text) => {
                let Ok(client_msg) = serde_json::from_slice::<ClientHandshake>(text.as_bytes())
                else {
                    ::metrics::counter!(METRICS_ID_HANDSHAKES_FAILED).increment(1);
                    return Err(Error::AuthRequired);
                };
                match client_msg {
                    ClientHandshake::SrpHello { identity, .. } => {
                        tracing::debug!("srp hello for {identity}");
                        let Some(credential) = services.credentials.lookup(&identity) else {
                            // Burn the same modexp an existing user would cost,
                            // then answer generically: neither the message nor
                            // the close code may reveal which usernames exist,
                            // so this closes exactly like a wrong password.
                            let decoy = srp::decoy_credentials(&identity);
                            let _ = srp::ServerHandshake::start(
                                &identity,
                                &decoy.salt,
                                &decoy.verifier,
                            );
                            send_handshake(
                                socket,
                                &ServerHandshake::SrpError {
                                    message: "invalid_credentials".to_owned(),
                                },
                            )
                            .await?;
                            ::metrics::counter!(METRICS_ID_HANDSHAKES_FAILED).increment(1);
                            return Err(Error::InvalidProof);
                        };
                        let state = srp::ServerHandshake::start(
                            &identity,
                            &credential.salt,
                            &credential.verifier,
                        )
                        .map_err(|err| {
                            tracing::error!("stored credential for {identity} is corrupt: {err}");
                            Error::Internal("corrupt credential".to_owned())
                        })?;
                        send_handshake(
                            socket,
                            &ServerHandshake::SrpServerChallenge {
                                salt: state.salt(),
                                b: state.public_ephemeral(),
                            },
                        )
                        .await?;
                        pending = Some((identity, state));
                    }
                    ClientHandshake::SrpProof { a, m1 } => {
                        let Some((identity, state)) = pending.take() else {
                            return Err(Error::AuthRequired);
                        };
                        let session = match state.verify(&a, &m1) {
                            Ok(session) => session,
                            Err(err) => {
                                tracing::debug!("proof rejected for {identity}: {err}");
                                ::metrics::counter!(METRICS_ID_HANDSHAKES_FAILED).increment(1);
                                return Err(Error::InvalidProof);
                            }
                        };
                        let key = derive_session_key(&session.secret);
                        let session_id =
                            services.sessions.create(&identity, &key).map_err(|err| {
                                tracing::error!("could not persist session: {err}");
                                Error::Internal("session persistence".to_owned())
                            })?;
                        send_handshake(
                            socket,
                            &ServerHandshake::SrpServerVerify {
                                m2: session.m2,
                                session_id,
                            },
                        )
                        .await?;
                        ::metrics::counter!(METRICS_ID_HANDSHAKES_OK).increment(1);
                        tracing::debug!("{identity} authenticated, session {session_id}");
                        return Ok(Authenticated {
                            key,
                            username: identity,
                            session_id,
                        });
                    }
                    ClientHandshake::SrpResume {
                        identity,
                        session_id,
                        proof,
                    } => match services.sessions.resume(session_id, &identity, &proof) {
                        Ok(key) => {
                            send_handshake(
                                socket,
                                &ServerHandshake::SrpSessionResumed { session_id },
                            )
                            .await?;
                            ::metrics::counter!(METRICS_ID_RESUMES_OK).increment(1);
                            tracing::debug!("{identity} resumed session {session_id}");
                            return Ok(Authenticated {
                                key,
                                username: identity,
                                session_id,
                            });
                        }
                        Err(reason) => {
                            ::metrics::counter!(METRICS_ID_RESUMES_FAILED).increment(1);
                            tracing::debug!("resume of {session_id} rejected: {reason:?}");
                            send_handshake(
                                socket,
                                &ServerHandshake::SrpSessionInvalid { reason },
                            )
                            .await?;
                            // the client may fall back to srp_hello
                        }
                    },
                }
            }
            Message::Binary(_) => return Err(Error::AuthRequired),
            Message::Close(_) => return Err(Error::ConnectionClosed),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn send_handshake(socket: &mut WebSocket, msg: &ServerHandshake) -> Result<(), Error> {
    let text = serde_json::to_string(msg).expect("handshake messages serialize");
    socket.send(Message::text(text)).await?;
    Ok(())
}

/// Sender half of a connection: seals application messages into envelopes
/// and pushes them onto the bounded outbound queue.
#[derive(Clone)]
pub(crate) struct Outbound {
    tx: mpsc::Sender<Message>,
    key: SessionKey,
    compression: Arc<AtomicBool>,
    compression_threshold: usize,
}

/// The peer is gone; whatever was being sent can be dropped.
pub(crate) struct PeerGone;

impl Outbound {
    async fn send_app(&self, msg: &AppMessage) -> Result<(), PeerGone> {
        let json = serde_json::to_vec(msg).expect("wire types serialize");
        let format = if self.compression.load(Ordering::Relaxed)
            && json.len() >= self.compression_threshold
        {
            PayloadFormat::CompressedJson
        } else {
            PayloadFormat::Json
        };
        let frame = envelope::seal(&self.key, format, &json).map_err(|err| {
            tracing::error!("could not seal outbound frame: {err}");
            PeerGone
        })?;
        self.tx
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|_| PeerGone)
    }
}

struct SubscriptionHandle {
    cancel: CancellationToken,
}

enum TrackerState {
    Active(PartUpload),
    /// Failed or finished; further chunks for the id are dropped.
    Closed,
}

struct UploadTracker {
    state: TrackerState,
    filename: String,
    mime_type: String,
    size: u64,
    bytes: u64,
    last_progress_bytes: u64,
    last_progress_at: Option<Instant>,
}

struct ConnState {
    subscriptions: HashMap<Uuid, SubscriptionHandle>,
    used_subscription_ids: HashSet<Uuid>,
    subscription_tasks: JoinSet<()>,
    requests: JoinSet<()>,
    request_slots: Arc<Semaphore>,
    uploads: HashMap<Uuid, UploadTracker>,
}

/// Runs the authenticated phase until the peer closes, an error maps to a
/// close code, or the server shuts down. Sends the close frame itself.
#[instrument(level = "debug", skip_all, fields(username = %auth.username, session = %auth.session_id))]
pub(crate) async fn run(
    socket: WebSocket,
    auth: Authenticated,
    services: ConnectionServices,
    shutdown: CancellationToken,
) {
    let limits = services.limits.clone();
    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(limits.outbound_queue_depth);
    let mut writer = tokio::spawn(writer_task(sink, out_rx));

    let outbound = Outbound {
        tx: out_tx.clone(),
        key: auth.key.clone(),
        compression: Arc::new(AtomicBool::new(false)),
        compression_threshold: limits.compression_threshold,
    };
    let mut state = ConnState {
        subscriptions: HashMap::new(),
        used_subscription_ids: HashSet::new(),
        subscription_tasks: JoinSet::new(),
        requests: JoinSet::new(),
        request_slots: Arc::new(Semaphore::new(limits.max_inflight_requests)),
        uploads: HashMap::new(),
    };

    let result = reader_loop(stream, &auth, &services, &outbound, &mut state, &shutdown).await;

    // Deterministic teardown: no task outlives the connection.
    for handle in state.subscriptions.values() {
        handle.cancel.cancel();
    }
    state.subscription_tasks.abort_all();
    while state.subscription_tasks.join_next().await.is_some() {}
    state.requests.abort_all();
    while state.requests.join_next().await.is_some() {}
    // Dropping the trackers discards unpromoted part files.
    state.uploads.clear();

    if let Err(err) = result
        && let Some(frame) = err.into_close_frame()
    {
        let _ = out_tx.send(Message::Close(Some(frame))).await;
    }
    drop(out_tx);
    drop(outbound);
    if tokio::time::timeout(Duration::from_secs(5), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() || is_close {
            break;
        }
    }
    let _ = sink.flush().await;
}

async fn reader_loop(
    mut stream: SplitStream<WebSocket>,
    auth: &Authenticated,
    services: &ConnectionServices,
    outbound: &Outbound,
    state: &mut ConnState,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::GoingAway),
            msg = stream.next() => match msg {
                Some(msg) => msg?,
                None => return Ok(()),
            },
        };
        match msg {
            Message::Binary(frame) => {
                let (format, payload) = envelope::open(&auth.key, &frame)
                    .map_err(|err| Error::Envelope(err.to_string()))?;
                match format {
                    PayloadFormat::Json | PayloadFormat::CompressedJson => {
                        let app_msg: AppMessage = serde_json::from_slice(&payload)
                            .map_err(|err| Error::Envelope(err.to_string()))?;
                        handle_message(app_msg, auth, services, outbound, state).await?;
                    }
                    PayloadFormat::UploadChunk => {
                        let chunk = ChunkPayload::from_bytes(&payload)
                            .map_err(|err| Error::Envelope(err.to_string()))?;
                        handle_chunk(chunk, outbound, state).await?;
                    }
                }
            }
            Message::Text(_) => {
                return Err(Error::Envelope("plaintext frame after auth".to_owned()));
            }
            Message::Close(_) => return Ok(()),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn handle_message(
    msg: AppMessage,
    auth: &Authenticated,
    services: &ConnectionServices,
    outbound: &Outbound,
    state: &mut ConnState,
) -> Result<(), Error> {
    match msg {
        AppMessage::Request {
            id,
            method,
            path,
            headers,
            body,
        } => {
            // Bounds our own in-flight work; when no slot is free we simply
            // stop reading further frames.
            let permit = Arc::clone(&state.request_slots)
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let router = Arc::clone(&services.router);
            let outbound = outbound.clone();
            let timeout = services.limits.request_timeout;
            let username = auth.username.clone();
            ::metrics::gauge!(METRICS_ID_REQUESTS_INFLIGHT).increment(1);
            state.requests.spawn(async move {
                let request = RouterRequest {
                    method,
                    path,
                    headers,
                    body,
                    username,
                };
                let response = match tokio::time::timeout(timeout, router.handle(request)).await {
                    Ok(response) => response,
                    Err(_) => RouterResponse::status(504),
                };
                let _ = outbound
                    .send_app(&AppMessage::Response {
                        id,
                        status: response.status,
                        headers: response.headers,
                        body: response.body,
                    })
                    .await;
                ::metrics::gauge!(METRICS_ID_REQUESTS_INFLIGHT).decrement(1);
                drop(permit);
            });
            Ok(())
        }
        AppMessage::Subscribe {
            subscription_id,
            channel,
            session_id,
            last_event_id,
        } => {
            if !state.used_subscription_ids.insert(subscription_id) {
                return Err(Error::DuplicateSubscription(subscription_id));
            }
            let cancel = CancellationToken::new();
            state.subscription_tasks.spawn(subscription_task(
                services.events.clone(),
                channel,
                session_id,
                last_event_id,
                subscription_id,
                outbound.clone(),
                services.limits.heartbeat_interval,
                cancel.clone(),
            ));
            state
                .subscriptions
                .insert(subscription_id, SubscriptionHandle { cancel });
            Ok(())
        }
        AppMessage::Unsubscribe { subscription_id } => {
            let Some(handle) = state.subscriptions.remove(&subscription_id) else {
                return Err(Error::UnknownSubscription(subscription_id));
            };
            handle.cancel.cancel();
            Ok(())
        }
        AppMessage::UploadStart {
            upload_id,
            project_id,
            session_id,
            filename,
            size,
            mime_type,
        } => {
            if state.uploads.contains_key(&upload_id) {
                return Err(Error::DuplicateUpload(upload_id));
            }
            match services
                .uploads
                .begin(&project_id, &session_id, upload_id, size)
                .await
            {
                Ok(part) => {
                    state.uploads.insert(
                        upload_id,
                        UploadTracker {
                            state: TrackerState::Active(part),
                            filename,
                            mime_type,
                            size,
                            bytes: 0,
                            last_progress_bytes: 0,
                            last_progress_at: None,
                        },
                    );
                }
                Err(err) => {
                    tracing::debug!("upload {upload_id} rejected: {err}");
                    state.uploads.insert(
                        upload_id,
                        UploadTracker {
                            state: TrackerState::Closed,
                            filename,
                            mime_type,
                            size,
                            bytes: 0,
                            last_progress_bytes: 0,
                            last_progress_at: None,
                        },
                    );
                    let _ = outbound
                        .send_app(&AppMessage::UploadError {
                            upload_id,
                            error: err.to_string(),
                        })
                        .await;
                }
            }
            Ok(())
        }
        AppMessage::UploadEnd { upload_id } => {
            let Some(tracker) = state.uploads.get_mut(&upload_id) else {
                tracing::debug!("upload_end for unknown upload {upload_id}");
                return Ok(());
            };
            match std::mem::replace(&mut tracker.state, TrackerState::Closed) {
                TrackerState::Closed => Ok(()),
                TrackerState::Active(part) => {
                    if tracker.bytes == tracker.size {
                        match part
                            .promote(&tracker.filename, &tracker.mime_type, tracker.size)
                            .await
                        {
                            Ok(file) => {
                                let _ = outbound
                                    .send_app(&AppMessage::UploadComplete { upload_id, file })
                                    .await;
                            }
                            Err(err) => {
                                tracing::error!("could not promote upload {upload_id}: {err}");
                                let _ = outbound
                                    .send_app(&AppMessage::UploadError {
                                        upload_id,
                                        error: "io_error".to_owned(),
                                    })
                                    .await;
                            }
                        }
                    } else {
                        drop(part);
                        let _ = outbound
                            .send_app(&AppMessage::UploadError {
                                upload_id,
                                error: "size_mismatch".to_owned(),
                            })
                            .await;
                    }
                    Ok(())
                }
            }
        }
        AppMessage::ClientCapabilities { formats } => {
            let compression = formats.contains(&PayloadFormat::CompressedJson);
            outbound
                .compression
                .store(compression, Ordering::Relaxed);
            tracing::debug!("peer capabilities: compression={compression}");
            Ok(())
        }
        AppMessage::Response { .. }
        | AppMessage::Event { .. }
        | AppMessage::UploadProgress { .. }
        | AppMessage::UploadComplete { .. }
        | AppMessage::UploadError { .. } => {
            // server-originated kinds have no meaning inbound
            tracing::debug!("ignoring unexpected inbound message");
            Ok(())
        }
    }
}

async fn handle_chunk(
    chunk: ChunkPayload,
    outbound: &Outbound,
    state: &mut ConnState,
) -> Result<(), Error> {
    let Some(tracker) = state.uploads.get_mut(&chunk.upload_id) else {
        tracing::debug!("chunk for unknown upload {}", chunk.upload_id);
        return Ok(());
    };
    let TrackerState::Active(part) = &mut tracker.state else {
        return Ok(());
    };
    let len = chunk.data.len() as u64;

    if chunk.offset == tracker.bytes {
        if tracker.bytes + len > tracker.size {
            tracker.state = TrackerState::Closed;
            let _ = outbound
                .send_app(&AppMessage::UploadError {
                    upload_id: chunk.upload_id,
                    error: "size_exceeded".to_owned(),
                })
                .await;
            return Ok(());
        }
        if let Err(err) = part.append(&chunk.data).await {
            tracing::error!("append to upload {} failed: {err}", chunk.upload_id);
            tracker.state = TrackerState::Closed;
            let _ = outbound
                .send_app(&AppMessage::UploadError {
                    upload_id: chunk.upload_id,
                    error: "io_error".to_owned(),
                })
                .await;
            return Ok(());
        }
        tracker.bytes += len;

        let elapsed_ok = tracker
            .last_progress_at
            .is_none_or(|at| at.elapsed() >= PROGRESS_INTERVAL);
        if tracker.bytes - tracker.last_progress_bytes >= PROGRESS_BYTES && elapsed_ok {
            tracker.last_progress_bytes = tracker.bytes;
            tracker.last_progress_at = Some(Instant::now());
            let _ = outbound
                .send_app(&AppMessage::UploadProgress {
                    upload_id: chunk.upload_id,
                    bytes_received: tracker.bytes,
                })
                .await;
        }
        Ok(())
    } else if chunk.offset < tracker.bytes && chunk.offset + len <= tracker.bytes {
        // retransmit of already-written bytes
        Ok(())
    } else {
        Err(Error::UploadOutOfOrder(chunk.upload_id))
    }
}

#[expect(clippy::too_many_arguments)]
async fn subscription_task(
    hub: EventHub,
    channel: Channel,
    session_filter: Option<String>,
    last_event_id: Option<u64>,
    subscription_id: Uuid,
    outbound: Outbound,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
) {
    // Resume from the cursor if the window still covers it, else go live.
    let mut cursor = match last_event_id {
        Some(cursor) => match hub.oldest_retained(channel) {
            Some(oldest) if cursor + 1 >= oldest => cursor,
            _ => hub.latest(channel),
        },
        None => hub.latest(channel),
    };

    let connected = AppMessage::Event {
        subscription_id,
        event_type: "connected".to_owned(),
        event_id: None,
        data: None,
    };
    if outbound.send_app(&connected).await.is_err() {
        return;
    }

    let mut latest = hub.watch(channel);
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        for event in hub.replay_after(channel, cursor) {
            if cancel.is_cancelled() {
                return;
            }
            cursor = event.event_id;
            if !event_matches(&event, session_filter.as_deref()) {
                continue;
            }
            let msg = AppMessage::Event {
                subscription_id,
                event_type: event.event_type,
                event_id: Some(event.event_id),
                data: event.data,
            };
            if outbound.send_app(&msg).await.is_err() {
                return;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = heartbeat.tick() => {
                let msg = AppMessage::Event {
                    subscription_id,
                    event_type: "heartbeat".to_owned(),
                    event_id: None,
                    data: None,
                };
                if outbound.send_app(&msg).await.is_err() {
                    return;
                }
            }
            changed = latest.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

fn event_matches(event: &PublishedEvent, session_filter: Option<&str>) -> bool {
    match session_filter {
        Some(filter) => event.session_scope.as_deref() == Some(filter),
        None => true,
    }
}
