use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context as _, bail};
use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use homelink_core::crypto::{SessionKey, derive_session_key};
use homelink_core::{envelope, srp};
use homelink_server::services::credential_store::CredentialStore;
use homelink_server::services::event_hub::EventHub;
use homelink_server::services::session_store::SessionStore;
use homelink_server::{
    AppRouter, RouterRequest, RouterResponse, ServerBuilder, ServerConfig,
};
use homelink_types::envelope::PayloadFormat;
use homelink_types::handshake::{ClientHandshake, ServerHandshake};
use homelink_types::messages::{AppMessage, Method};

pub const IDENTITY: &str = "alice";
pub const PASSWORD: &str = "correct horse battery staple";

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Test router: health/version/echo plus a deliberately slow route.
pub struct EchoRouter;

#[async_trait]
impl AppRouter for EchoRouter {
    async fn handle(&self, request: RouterRequest) -> RouterResponse {
        match (request.method, request.path.as_str()) {
            (Method::Get, "/health") => RouterResponse::ok(json!({"status": "ok"})),
            (Method::Get, "/version") => {
                RouterResponse::ok(json!({"version": env!("CARGO_PKG_VERSION")}))
            }
            (Method::Get, "/big") => {
                RouterResponse::ok(json!({"blob": "x".repeat(16 * 1024)}))
            }
            (Method::Get, "/slow") => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                RouterResponse::ok(json!({"slept": true}))
            }
            (Method::Post, "/echo") => RouterResponse {
                status: 200,
                headers: None,
                body: request.body,
            },
            _ => RouterResponse::status(404),
        }
    }
}

pub fn test_config(data_dir: PathBuf) -> ServerConfig {
    ServerConfig {
        ws_max_message_size: 2 * 1024 * 1024,
        handshake_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_millis(500),
        max_inflight_requests: 8,
        outbound_queue_depth: 64,
        heartbeat_interval: Duration::from_secs(30),
        event_retention: 16,
        session_ttl: Duration::from_secs(3600),
        session_capacity: 64,
        session_sweep_interval: Duration::from_secs(60),
        upload_quota_bytes: 512 * 1024,
        upload_slots: 2,
        compression_threshold: 4096,
        data_dir,
    }
}

pub struct TestServer {
    pub url: String,
    pub credentials: CredentialStore,
    pub sessions: SessionStore,
    pub events: EventHub,
    pub token: CancellationToken,
    pub data_dir: PathBuf,
    _tempdir: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> eyre::Result<Self> {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(adjust: impl FnOnce(&mut ServerConfig)) -> eyre::Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let tempdir = tempfile::tempdir().context("while creating data dir")?;
        let data_dir = tempdir.path().to_path_buf();
        let mut config = test_config(data_dir.clone());
        adjust(&mut config);

        let token = CancellationToken::new();
        let builder = ServerBuilder::init(config, Arc::new(EchoRouter), token.clone())
            .await
            .context("while initializing server")?;
        let credentials = builder.credentials();
        let sessions = builder.sessions();
        let events = builder.events();

        let registered = srp::register_credentials(IDENTITY, PASSWORD);
        credentials.register(IDENTITY, &registered.salt, &registered.verifier)?;

        let (router, _sweeper) = builder.build();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("while binding listener")?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("server runs");
        });

        Ok(Self {
            url: format!("ws://{addr}/ws"),
            credentials,
            sessions,
            events,
            token,
            data_dir,
            _tempdir: tempdir,
        })
    }

    /// Authenticated channel through the client library.
    pub async fn login(&self) -> eyre::Result<homelink_client::SecureChannel> {
        let transport = homelink_client::Transport::connect_direct(&self.url).await?;
        Ok(homelink_client::SecureChannel::login(transport, IDENTITY, PASSWORD).await?)
    }
}

pub async fn raw_connect(url: &str) -> eyre::Result<RawSocket> {
    let (socket, _) = connect_async(url).await?;
    Ok(socket)
}

/// Manual SRP login over a raw socket, for tests that need to craft frames.
pub async fn raw_login(url: &str) -> eyre::Result<(RawSocket, SessionKey)> {
    let mut socket = raw_connect(url).await?;
    let key = raw_login_on(&mut socket).await?;
    Ok((socket, key))
}

/// Runs the SRP exchange on an already-open socket.
pub async fn raw_login_on(socket: &mut RawSocket) -> eyre::Result<SessionKey> {
    send_json(
        socket,
        &ClientHandshake::SrpHello {
            identity: IDENTITY.to_owned(),
            browser_profile_id: None,
            origin_metadata: None,
        },
    )
    .await?;
    let ServerHandshake::SrpServerChallenge { salt, b } = read_server_msg(socket).await? else {
        bail!("expected challenge");
    };
    let client = srp::ClientHandshake::new(IDENTITY, PASSWORD);
    let a = client.public_ephemeral();
    let session = client.process_challenge(&salt, &b)?;
    send_json(
        socket,
        &ClientHandshake::SrpProof {
            a,
            m1: session.m1.clone(),
        },
    )
    .await?;
    let ServerHandshake::SrpServerVerify { m2, .. } = read_server_msg(socket).await? else {
        bail!("expected verify");
    };
    session.verify_server(&m2)?;
    Ok(derive_session_key(&session.secret))
}

pub async fn send_json<T: Serialize>(socket: &mut RawSocket, msg: &T) -> eyre::Result<()> {
    socket
        .send(Message::text(serde_json::to_string(msg)?))
        .await?;
    Ok(())
}

pub async fn read_server_msg(socket: &mut RawSocket) -> eyre::Result<ServerHandshake> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next()).await? {
            Some(Ok(Message::Text(text))) => {
                return Ok(serde_json::from_slice(text.as_bytes())?);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => bail!("closed during handshake: {frame:?}"),
            other => bail!("unexpected frame: {other:?}"),
        }
    }
}

pub async fn send_envelope(
    socket: &mut RawSocket,
    key: &SessionKey,
    format: PayloadFormat,
    payload: &[u8],
) -> eyre::Result<()> {
    let frame = envelope::seal(key, format, payload)?;
    socket.send(Message::binary(frame)).await?;
    Ok(())
}

pub async fn send_app(
    socket: &mut RawSocket,
    key: &SessionKey,
    msg: &AppMessage,
) -> eyre::Result<()> {
    send_envelope(socket, key, PayloadFormat::Json, &serde_json::to_vec(msg)?).await
}

/// Reads binary envelopes until the next application message.
pub async fn read_app(socket: &mut RawSocket, key: &SessionKey) -> eyre::Result<AppMessage> {
    let (_, msg) = read_app_with_format(socket, key).await?;
    Ok(msg)
}

/// Like [`read_app`], additionally returning the envelope's payload format.
pub async fn read_app_with_format(
    socket: &mut RawSocket,
    key: &SessionKey,
) -> eyre::Result<(PayloadFormat, AppMessage)> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next()).await? {
            Some(Ok(Message::Binary(frame))) => {
                let (format, payload) = envelope::open(key, &frame)?;
                return Ok((format, serde_json::from_slice(&payload)?));
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => bail!("closed: {frame:?}"),
            other => bail!("unexpected frame: {other:?}"),
        }
    }
}

/// Waits for the server's close frame and returns `(code, reason)`.
pub async fn expect_close(socket: &mut RawSocket) -> eyre::Result<(u16, String)> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next()).await? {
            Some(Ok(Message::Close(Some(frame)))) => {
                return Ok((frame.code.into(), frame.reason.to_string()));
            }
            Some(Ok(Message::Close(None))) => bail!("close without code"),
            Some(Ok(_)) => {}
            Some(Err(err)) => bail!("socket error before close: {err}"),
            None => bail!("eof before close"),
        }
    }
}
