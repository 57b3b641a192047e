use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context as _, bail};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use homelink_client::{Error, SecureChannel, SessionCache, Transport, UploadMeta};
use homelink_core::srp;
use homelink_server::services::session_store::SessionStore;
use homelink_server::{
    AppRouter, RouterRequest, RouterResponse, ServerBuilder, ServerConfig,
};
use homelink_types::handshake::ResumeFailure;
use homelink_types::messages::{Channel, Method};

const IDENTITY: &str = "alice";
const PASSWORD: &str = "correct horse battery staple";

struct EchoRouter;

#[async_trait::async_trait]
impl AppRouter for EchoRouter {
    async fn handle(&self, request: RouterRequest) -> RouterResponse {
        match (request.method, request.path.as_str()) {
            (Method::Get, "/health") => RouterResponse::ok(json!({"status": "ok"})),
            (Method::Post, "/echo") => RouterResponse {
                status: 200,
                headers: None,
                body: request.body,
            },
            _ => RouterResponse::status(404),
        }
    }
}

struct TestServer {
    url: String,
    sessions: SessionStore,
    token: CancellationToken,
    _tempdir: tempfile::TempDir,
}

async fn start_server() -> eyre::Result<TestServer> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();

    let tempdir = tempfile::tempdir()?;
    let config = ServerConfig {
        ws_max_message_size: 2 * 1024 * 1024,
        handshake_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        max_inflight_requests: 8,
        outbound_queue_depth: 64,
        heartbeat_interval: Duration::from_secs(30),
        event_retention: 16,
        session_ttl: Duration::from_secs(3600),
        session_capacity: 64,
        session_sweep_interval: Duration::from_secs(60),
        upload_quota_bytes: 1024 * 1024,
        upload_slots: 2,
        compression_threshold: 4096,
        data_dir: tempdir.path().to_path_buf(),
    };
    let token = CancellationToken::new();
    let builder = ServerBuilder::init(config, Arc::new(EchoRouter), token.clone())
        .await
        .context("while initializing server")?;
    let registered = srp::register_credentials(IDENTITY, PASSWORD);
    builder
        .credentials()
        .register(IDENTITY, &registered.salt, &registered.verifier)?;
    let sessions = builder.sessions();

    let (router, _sweeper) = builder.build();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server runs");
    });

    Ok(TestServer {
        url: format!("ws://{addr}/ws"),
        sessions,
        token,
        _tempdir: tempdir,
    })
}

#[tokio::test]
async fn login_request_subscribe_upload() -> eyre::Result<()> {
    let server = start_server().await?;
    let transport = Transport::connect_direct(&server.url).await?;
    let channel = SecureChannel::login(transport, IDENTITY, PASSWORD).await?;

    let response = channel
        .request(Method::Post, "/echo", None, Some(json!({"hello": "world"})))
        .await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, Some(json!({"hello": "world"})));

    let mut subscription = channel.subscribe(Channel::Activity, None, None).await?;
    let connected = tokio::time::timeout(Duration::from_millis(500), subscription.next())
        .await?
        .expect("stream open");
    assert_eq!(connected.event_type, "connected");

    let data = vec![0x5Au8; 100 * 1024];
    let outcome = channel
        .upload(
            UploadMeta {
                project_id: "proj".to_owned(),
                session_id: "sess".to_owned(),
                filename: "dump.bin".to_owned(),
                mime_type: "application/octet-stream".to_owned(),
            },
            &data,
        )
        .await?;
    assert_eq!(outcome.file.size, data.len() as u64);

    channel.close().await;
    Ok(())
}

#[tokio::test]
async fn session_cache_enables_password_free_reconnect() -> eyre::Result<()> {
    let server = start_server().await?;
    let cache_dir = tempfile::tempdir()?;
    let cache = SessionCache::open(PathBuf::from(cache_dir.path()).join("sessions.json"))?;

    {
        let transport = Transport::connect_direct(&server.url).await?;
        let channel = SecureChannel::login(transport, IDENTITY, PASSWORD).await?;
        cache.store(&server.url, channel.stored_session())?;
        channel.close().await;
    }

    let stored = cache.load(&server.url).expect("session cached");
    let transport = Transport::connect_direct(&server.url).await?;
    let channel = SecureChannel::resume(transport, &stored).await?;
    channel.bind_session_cache(cache.clone(), server.url.clone());

    let response = channel.request(Method::Get, "/health", None, None).await?;
    assert_eq!(response.status, 200);
    channel.close().await;
    Ok(())
}

#[tokio::test]
async fn revoked_session_is_fatal_in_resume_only_mode() -> eyre::Result<()> {
    let server = start_server().await?;
    let transport = Transport::connect_direct(&server.url).await?;
    let channel = SecureChannel::login(transport, IDENTITY, PASSWORD).await?;
    let stored = channel.stored_session();
    channel.close().await;

    server.sessions.revoke(stored.session_id)?;

    let transport = Transport::connect_direct(&server.url).await?;
    match SecureChannel::resume(transport, &stored).await {
        Err(Error::SessionInvalid(ResumeFailure::Unknown)) => Ok(()),
        other => bail!("expected fatal session_invalid, got {other:?}"),
    }
}

#[tokio::test]
async fn request_after_close_fails_uniformly() -> eyre::Result<()> {
    let server = start_server().await?;
    let transport = Transport::connect_direct(&server.url).await?;
    let channel = SecureChannel::login(transport, IDENTITY, PASSWORD).await?;

    // force the server side down
    server.token.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // outstanding and new requests fail with a channel-level error, not a hang
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        channel.request(Method::Get, "/health", None, None),
    )
    .await?;
    assert!(result.is_err());
    Ok(())
}
