//! The secure channel: handshake, then multiplexed encrypted traffic.
//!
//! [`SecureChannel::login`] runs the full SRP exchange (verifying the server
//! proof before trusting anything), [`SecureChannel::resume`] presents a
//! stored session instead; in resume-only operation a rejected resume is
//! fatal and the caller decides whether to fall back to a password.
//!
//! After authentication a driver task owns the socket. It correlates
//! `response` frames to outstanding requests through a `requestId → oneshot`
//! map, fans `event` frames out to per-subscription bounded streams, and
//! routes upload acknowledgments. When the connection dies, every
//! outstanding request is drained with one uniform error and, on the
//! non-retryable close codes 4001/4003, the bound session cache entry is
//! cleared so the next connection runs a full handshake.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::instrument;
use uuid::Uuid;

use homelink_core::crypto::{SessionKey, derive_session_key};
use homelink_core::envelope;
use homelink_core::srp;
use homelink_types::close_codes;
use homelink_types::envelope::{ChunkPayload, PayloadFormat};
use homelink_types::handshake::{ClientHandshake, ResumeFailure, ServerHandshake};
use homelink_types::messages::{AppMessage, Channel, FileDescriptor, Method};

use crate::Error;
use crate::session::{SessionCache, StoredSession};
use crate::transport::{Transport, WsStream, close_error};

/// Client-side deadline for one request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for each handshake reply.
const HANDSHAKE_REPLY_TIMEOUT: Duration = Duration::from_secs(30);
/// Upload chunk size.
const CHUNK_SIZE: usize = 64 * 1024;
/// Buffered events per subscription before the driver applies backpressure.
const EVENT_BUFFER: usize = 64;

/// A completed response.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP-like status code.
    pub status: u16,
    /// Optional header map.
    pub headers: Option<BTreeMap<String, String>>,
    /// JSON body.
    pub body: Option<Value>,
}

/// One event delivered on a subscription.
#[derive(Debug, Clone)]
pub struct EventMessage {
    /// Channel-specific event kind.
    pub event_type: String,
    /// Monotonic per-channel cursor; absent on transport events.
    pub event_id: Option<u64>,
    /// Opaque payload.
    pub data: Option<Value>,
}

/// A live subscription. Drop it (after unsubscribing) to stop receiving.
pub struct Subscription {
    /// The id this subscription runs under.
    pub subscription_id: Uuid,
    events: mpsc::Receiver<EventMessage>,
}

impl Subscription {
    /// The next event, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<EventMessage> {
        self.events.recv().await
    }
}

/// Metadata announced with an upload.
#[derive(Debug, Clone)]
pub struct UploadMeta {
    /// Project the file belongs to.
    pub project_id: String,
    /// Agent session the file belongs to.
    pub session_id: String,
    /// Filename to store under.
    pub filename: String,
    /// Declared MIME type.
    pub mime_type: String,
}

/// Result of a finished upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Descriptor of the stored file.
    pub file: FileDescriptor,
    /// Byte counts of the progress reports observed along the way.
    pub progress: Vec<u64>,
}

enum UploadUpdate {
    Progress(u64),
    Complete(FileDescriptor),
    Failed(String),
}

enum Command {
    Request {
        id: Uuid,
        msg: AppMessage,
        reply: oneshot::Sender<Result<Response, Error>>,
    },
    Subscribe {
        id: Uuid,
        msg: AppMessage,
        events: mpsc::Sender<EventMessage>,
    },
    Unsubscribe {
        id: Uuid,
    },
    Upload {
        id: Uuid,
        start: AppMessage,
        updates: mpsc::UnboundedSender<UploadUpdate>,
    },
    Frame(Message),
    SendApp(AppMessage),
    Close,
}

struct Shared {
    close: Mutex<Option<(u16, String)>>,
    cache: Mutex<Option<(SessionCache, String)>>,
}

/// An authenticated connection to a homelink server.
pub struct SecureChannel {
    cmd_tx: mpsc::Sender<Command>,
    key: SessionKey,
    session: StoredSession,
    shared: Arc<Shared>,
    driver: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("identity", &self.session.identity)
            .field("session_id", &self.session.session_id)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Authenticates with a full SRP handshake.
    ///
    /// Verifies the server's `M2` proof before returning, so a successful
    /// login implies mutual authentication.
    #[instrument(level = "debug", skip_all, fields(identity = %identity))]
    pub async fn login(
        mut transport: Transport,
        identity: &str,
        password: &str,
    ) -> Result<Self, Error> {
        tracing::debug!("starting srp handshake");
        let hello = ClientHandshake::SrpHello {
            identity: identity.to_owned(),
            browser_profile_id: None,
            origin_metadata: None,
        };
        transport.send_text(to_json(&hello)).await?;

        let (salt, b) = match read_handshake(&mut transport).await? {
            ServerHandshake::SrpServerChallenge { salt, b } => (salt, b),
            ServerHandshake::SrpError { message } => return Err(Error::ServerError(message)),
            _ => return Err(Error::UnexpectedMsg),
        };

        let client = srp::ClientHandshake::new(identity, password);
        let a = client.public_ephemeral();
        let session = client.process_challenge(&salt, &b)?;
        let proof = ClientHandshake::SrpProof {
            a,
            m1: session.m1.clone(),
        };
        transport.send_text(to_json(&proof)).await?;

        let (m2, session_id) = match read_handshake(&mut transport).await? {
            ServerHandshake::SrpServerVerify { m2, session_id } => (m2, session_id),
            ServerHandshake::SrpError { message } => return Err(Error::ServerError(message)),
            _ => return Err(Error::UnexpectedMsg),
        };
        session.verify_server(&m2)?;
        let key = derive_session_key(&session.secret);
        tracing::debug!("authenticated, session {session_id}");
        Ok(Self::spawn(transport, identity, session_id, key))
    }

    /// Authenticates by resuming a stored session, without a password.
    ///
    /// Any `srp_session_invalid` is returned as [`Error::SessionInvalid`];
    /// clear the stored session and fall back to [`SecureChannel::login`] on
    /// a fresh transport if a password is available.
    #[instrument(level = "debug", skip_all, fields(identity = %stored.identity))]
    pub async fn resume(mut transport: Transport, stored: &StoredSession) -> Result<Self, Error> {
        let key = stored
            .key()
            .ok_or(Error::SessionInvalid(ResumeFailure::BadProof))?;
        let proof = envelope::resume_proof_now(&key)?;
        let resume = ClientHandshake::SrpResume {
            identity: stored.identity.clone(),
            session_id: stored.session_id,
            proof,
        };
        transport.send_text(to_json(&resume)).await?;

        match read_handshake(&mut transport).await? {
            ServerHandshake::SrpSessionResumed { session_id } => {
                tracing::debug!("resumed session {session_id}");
                Ok(Self::spawn(transport, &stored.identity, session_id, key))
            }
            ServerHandshake::SrpSessionInvalid { reason } => Err(Error::SessionInvalid(reason)),
            ServerHandshake::SrpError { message } => Err(Error::ServerError(message)),
            _ => Err(Error::UnexpectedMsg),
        }
    }

    fn spawn(transport: Transport, identity: &str, session_id: Uuid, key: SessionKey) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let shared = Arc::new(Shared {
            close: Mutex::new(None),
            cache: Mutex::new(None),
        });
        let driver = Driver {
            stream: transport.stream,
            key: key.clone(),
            cmd_rx,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
            uploads: HashMap::new(),
            shared: Arc::clone(&shared),
        };
        let handle = tokio::spawn(driver.run());
        Self {
            cmd_tx,
            session: StoredSession::new(identity, session_id, &key),
            key,
            shared,
            driver: handle,
        }
    }

    /// The resumable session for this connection, to be persisted client-side.
    pub fn stored_session(&self) -> StoredSession {
        self.session.clone()
    }

    /// Binds a session cache entry to this channel: if the server closes
    /// with a non-retryable code (4001, 4003) the entry is cleared.
    pub fn bind_session_cache(&self, cache: SessionCache, scope: impl Into<String>) {
        *self.shared.cache.lock() = Some((cache, scope.into()));
    }

    /// The close code and reason the server sent, once the connection died.
    pub fn close_info(&self) -> Option<(u16, String)> {
        self.shared.close.lock().clone()
    }

    /// Issues one request and awaits its response (30 s deadline).
    #[instrument(level = "debug", skip_all, fields(path = %path))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: Option<BTreeMap<String, String>>,
        body: Option<Value>,
    ) -> Result<Response, Error> {
        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = AppMessage::Request {
            id,
            method,
            path: path.to_owned(),
            headers,
            body,
        };
        self.cmd_tx
            .send(Command::Request {
                id,
                msg,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Opens a subscription; the returned stream yields the immediate
    /// `connected` event first.
    #[instrument(level = "debug", skip_all)]
    pub async fn subscribe(
        &self,
        channel: Channel,
        session_id: Option<String>,
        last_event_id: Option<u64>,
    ) -> Result<Subscription, Error> {
        let id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let msg = AppMessage::Subscribe {
            subscription_id: id,
            channel,
            session_id,
            last_event_id,
        };
        self.cmd_tx
            .send(Command::Subscribe {
                id,
                msg,
                events: events_tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        Ok(Subscription {
            subscription_id: id,
            events: events_rx,
        })
    }

    /// Stops a subscription. The server delivers nothing for the id after
    /// this; frames already in flight may still arrive on the stream.
    pub async fn unsubscribe(&self, subscription_id: Uuid) -> Result<(), Error> {
        self.cmd_tx
            .send(Command::Unsubscribe {
                id: subscription_id,
            })
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Announces which payload formats this client can decode.
    pub async fn send_capabilities(&self, formats: Vec<PayloadFormat>) -> Result<(), Error> {
        self.cmd_tx
            .send(Command::SendApp(AppMessage::ClientCapabilities { formats }))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Uploads `data` in 64 KiB chunks and waits for the completion ack.
    #[instrument(level = "debug", skip_all, fields(filename = %meta.filename, size = data.len()))]
    pub async fn upload(&self, meta: UploadMeta, data: &[u8]) -> Result<UploadOutcome, Error> {
        let upload_id = Uuid::new_v4();
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let start = AppMessage::UploadStart {
            upload_id,
            project_id: meta.project_id,
            session_id: meta.session_id,
            filename: meta.filename,
            size: data.len() as u64,
            mime_type: meta.mime_type,
        };
        self.cmd_tx
            .send(Command::Upload {
                id: upload_id,
                start,
                updates: updates_tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;

        let mut offset = 0u64;
        for chunk in data.chunks(CHUNK_SIZE) {
            let payload = ChunkPayload {
                upload_id,
                offset,
                data: chunk.to_vec(),
            }
            .to_bytes();
            let frame = envelope::seal(&self.key, PayloadFormat::UploadChunk, &payload)?;
            self.cmd_tx
                .send(Command::Frame(Message::binary(frame)))
                .await
                .map_err(|_| Error::ChannelClosed)?;
            offset += chunk.len() as u64;
        }
        self.cmd_tx
            .send(Command::SendApp(AppMessage::UploadEnd { upload_id }))
            .await
            .map_err(|_| Error::ChannelClosed)?;

        let mut progress = Vec::new();
        loop {
            match updates_rx.recv().await {
                Some(UploadUpdate::Progress(bytes)) => progress.push(bytes),
                Some(UploadUpdate::Complete(file)) => {
                    return Ok(UploadOutcome { file, progress });
                }
                Some(UploadUpdate::Failed(error)) => return Err(Error::Upload(error)),
                None => return Err(self.closed_error()),
            }
        }
    }

    /// Gracefully closes the connection.
    pub async fn close(self) {
        let _ = self.cmd_tx.send(Command::Close).await;
        let _ = self.driver.await;
    }

    fn closed_error(&self) -> Error {
        match self.shared.close.lock().clone() {
            Some((code, reason)) => Error::Closed { code, reason },
            None => Error::Eof,
        }
    }
}

fn to_json<T: serde::Serialize>(msg: &T) -> String {
    serde_json::to_string(msg).expect("wire types serialize")
}

async fn read_handshake(transport: &mut Transport) -> Result<ServerHandshake, Error> {
    let text = tokio::time::timeout(HANDSHAKE_REPLY_TIMEOUT, transport.recv_text())
        .await
        .map_err(|_| Error::Timeout)??;
    serde_json::from_str(&text).map_err(|_| Error::UnexpectedMsg)
}

struct Driver {
    stream: WsStream,
    key: SessionKey,
    cmd_rx: mpsc::Receiver<Command>,
    pending: HashMap<Uuid, oneshot::Sender<Result<Response, Error>>>,
    subscriptions: HashMap<Uuid, mpsc::Sender<EventMessage>>,
    uploads: HashMap<Uuid, mpsc::UnboundedSender<UploadUpdate>>,
    shared: Arc<Shared>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // every handle dropped
                        let _ = self.stream.close(None).await;
                        break;
                    };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                frame = self.stream.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            if !self.handle_frame(msg).await {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            tracing::debug!("read failed: {err}");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        self.drain();
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Request { id, msg, reply } => {
                self.pending.insert(id, reply);
                if !self.send_app(&msg).await {
                    if let Some(reply) = self.pending.remove(&id) {
                        let _ = reply.send(Err(Error::Eof));
                    }
                    return false;
                }
                true
            }
            Command::Subscribe { id, msg, events } => {
                self.subscriptions.insert(id, events);
                self.send_app(&msg).await
            }
            Command::Unsubscribe { id } => {
                self.subscriptions.remove(&id);
                self.send_app(&AppMessage::Unsubscribe {
                    subscription_id: id,
                })
                .await
            }
            Command::Upload { id, start, updates } => {
                self.uploads.insert(id, updates);
                self.send_app(&start).await
            }
            Command::Frame(msg) => self.stream.send(msg).await.is_ok(),
            Command::SendApp(msg) => self.send_app(&msg).await,
            Command::Close => {
                let _ = self.stream.close(None).await;
                false
            }
        }
    }

    async fn send_app(&mut self, msg: &AppMessage) -> bool {
        let json = serde_json::to_vec(msg).expect("wire types serialize");
        match envelope::seal(&self.key, PayloadFormat::Json, &json) {
            Ok(frame) => self.stream.send(Message::binary(frame)).await.is_ok(),
            Err(err) => {
                tracing::error!("could not seal outbound frame: {err}");
                false
            }
        }
    }

    async fn handle_frame(&mut self, msg: Message) -> bool {
        match msg {
            Message::Binary(frame) => {
                let (_, payload) = match envelope::open(&self.key, &frame) {
                    Ok(opened) => opened,
                    Err(err) => {
                        tracing::debug!("dropping undecodable frame: {err}");
                        return false;
                    }
                };
                let Ok(app_msg) = serde_json::from_slice::<AppMessage>(&payload) else {
                    tracing::debug!("dropping unparsable frame");
                    return false;
                };
                self.dispatch(app_msg).await;
                true
            }
            Message::Close(frame) => {
                if let Error::Closed { code, reason } = close_error(frame) {
                    if clears_stored_session(code) {
                        let binding = self.shared.cache.lock().clone();
                        if let Some((cache, scope)) = binding {
                            tracing::debug!("clearing stored session for {scope}");
                            let _ = cache.clear(&scope);
                        }
                    }
                    *self.shared.close.lock() = Some((code, reason));
                }
                false
            }
            Message::Text(_) => {
                tracing::debug!("unexpected plaintext frame after auth");
                false
            }
            Message::Ping(_) | Message::Pong(_) => true,
            _ => true,
        }
    }

    async fn dispatch(&mut self, msg: AppMessage) {
        match msg {
            AppMessage::Response {
                id,
                status,
                headers,
                body,
            } => {
                if let Some(reply) = self.pending.remove(&id) {
                    let _ = reply.send(Ok(Response {
                        status,
                        headers,
                        body,
                    }));
                } else {
                    tracing::debug!("response for unknown request {id}");
                }
            }
            AppMessage::Event {
                subscription_id,
                event_type,
                event_id,
                data,
            } => {
                let gone = if let Some(events) = self.subscriptions.get(&subscription_id) {
                    events
                        .send(EventMessage {
                            event_type,
                            event_id,
                            data,
                        })
                        .await
                        .is_err()
                } else {
                    false
                };
                if gone {
                    self.subscriptions.remove(&subscription_id);
                }
            }
            AppMessage::UploadProgress {
                upload_id,
                bytes_received,
            } => {
                if let Some(updates) = self.uploads.get(&upload_id) {
                    let _ = updates.send(UploadUpdate::Progress(bytes_received));
                }
            }
            AppMessage::UploadComplete { upload_id, file } => {
                if let Some(updates) = self.uploads.remove(&upload_id) {
                    let _ = updates.send(UploadUpdate::Complete(file));
                }
            }
            AppMessage::UploadError { upload_id, error } => {
                if let Some(updates) = self.uploads.remove(&upload_id) {
                    let _ = updates.send(UploadUpdate::Failed(error));
                }
            }
            _ => {
                tracing::debug!("ignoring unexpected inbound message");
            }
        }
    }

    fn drain(&mut self) {
        let closed = self.shared.close.lock().clone();
        for (_, reply) in self.pending.drain() {
            let err = match &closed {
                Some((code, reason)) => Error::Closed {
                    code: *code,
                    reason: reason.clone(),
                },
                None => Error::Eof,
            };
            let _ = reply.send(Err(err));
        }
        self.subscriptions.clear();
        self.uploads.clear();
    }
}

/// The non-retryable close codes: resumable state must be discarded and the
/// next connection must run a full handshake.
fn clears_stored_session(code: u16) -> bool {
    code == close_codes::AUTH_REQUIRED || code == close_codes::INVALID_ENVELOPE
}
