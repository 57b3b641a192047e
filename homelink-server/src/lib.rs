#![deny(missing_docs)]
//! Server half of the homelink secure multiplexed transport.
//!
//! This crate carries every client–server interaction of a homelink
//! deployment over one WebSocket per connection: SRP-6a mutual
//! authentication (or a session resume), then authenticated end-to-end
//! encrypted envelopes multiplexing HTTP-like requests, long-lived event
//! subscriptions and chunked file uploads. What the carried requests *mean*
//! is the hosting application's business; it plugs in through the
//! [`app::AppRouter`] trait and publishes events through the
//! [`services::event_hub::EventHub`].
//!
//! The main entry point is the [`ServerBuilder`]. It opens the persistent
//! stores under the configured data directory, spawns the session eviction
//! task, and produces an `axum::Router` to be served by the hosting
//! application together with a `JoinHandle` for the background task.
//!
//! Shutdown is cooperative: cancelling the provided `CancellationToken`
//! closes every live connection with code 4009 and stops the background
//! task. To shut down gracefully, cancel the token and await the handle.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use homelink_server::{ServerBuilder, app::{AppRouter, RouterRequest, RouterResponse}};
//! # use tokio_util::sync::CancellationToken;
//! # struct MyRouter;
//! # #[async_trait::async_trait]
//! # impl AppRouter for MyRouter {
//! #     async fn handle(&self, _request: RouterRequest) -> RouterResponse {
//! #         RouterResponse::status(404)
//! #     }
//! # }
//! # async fn example(config: homelink_server::config::ServerConfig) -> eyre::Result<()> {
//! let token = CancellationToken::new();
//! let builder = ServerBuilder::init(config, Arc::new(MyRouter), token.clone()).await?;
//! builder.credentials().register("alice", "<salt hex>", "<verifier hex>")?;
//! let (router, background) = builder.build();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, router).await?;
//! token.cancel();
//! background.await??;
//! # Ok(())
//! # }
//! ```

use eyre::Context as _;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::connection::{ConnectionServices, Limits};
use crate::services::credential_store::CredentialStore;
use crate::services::event_hub::EventHub;
use crate::services::session_store::SessionStore;
use crate::services::upload_store::UploadStore;

pub mod app;
pub(crate) mod api;
pub mod config;
pub(crate) mod connection;
pub mod metrics;
pub mod services;

pub use app::{AppRouter, AppRouterService, RouterRequest, RouterResponse};
pub use config::ServerConfig;

/// Builder wiring the transport's stores, background tasks and websocket
/// endpoint together.
pub struct ServerBuilder {
    config: ServerConfig,
    credentials: CredentialStore,
    sessions: SessionStore,
    uploads: UploadStore,
    events: EventHub,
    router: AppRouterService,
    shutdown: CancellationToken,
    session_sweeper: tokio::task::JoinHandle<eyre::Result<()>>,
}

impl ServerBuilder {
    /// Initializes the transport server.
    ///
    /// Opens the credential journal, the session store and the upload store
    /// under `config.data_dir`, creates the event hub, and spawns the
    /// session eviction task.
    pub async fn init(
        config: ServerConfig,
        router: AppRouterService,
        cancellation_token: CancellationToken,
    ) -> eyre::Result<Self> {
        ::metrics::gauge!(metrics::METRICS_ID_CONNECTIONS_OPEN).set(0);
        tracing::info!("opening stores under {:?}", config.data_dir);
        let credentials = CredentialStore::open(config.data_dir.join("credentials.jsonl"))
            .context("while opening credential store")?;
        let sessions = SessionStore::open(
            config.data_dir.join("sessions.json"),
            config.session_ttl,
            config.session_capacity,
        )
        .context("while opening session store")?;
        let uploads = UploadStore::new(
            config.data_dir.join("uploads"),
            config.upload_quota_bytes,
            config.upload_slots,
        )
        .context("while opening upload store")?;
        let events = EventHub::new(config.event_retention);

        tracing::info!("spawning session sweeper..");
        let session_sweeper = tokio::spawn({
            let sessions = sessions.clone();
            let token = cancellation_token.clone();
            let mut interval = tokio::time::interval(config.session_sweep_interval);
            async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = interval.tick() => {
                            match sessions.evict_expired() {
                                Ok(0) => {}
                                Ok(evicted) => tracing::debug!("evicted {evicted} expired sessions"),
                                Err(err) => tracing::error!("session sweep failed: {err}"),
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            config,
            credentials,
            sessions,
            uploads,
            events,
            router,
            shutdown: cancellation_token,
            session_sweeper,
        })
    }

    /// Handle to the credential store, e.g. for the registration surface.
    pub fn credentials(&self) -> CredentialStore {
        self.credentials.clone()
    }

    /// Handle to the resumable-session store, e.g. for explicit revokes.
    pub fn sessions(&self) -> SessionStore {
        self.sessions.clone()
    }

    /// Handle to the event hub the application publishes into.
    pub fn events(&self) -> EventHub {
        self.events.clone()
    }

    /// Builds the `axum` [`axum::Router`] carrying the `/ws` endpoint.
    ///
    /// # Returns
    ///
    /// Returns a tuple containing:
    /// - The router, to be mounted into the hosting application's server.
    /// - A `JoinHandle` for the session eviction task.
    pub fn build(self) -> (axum::Router, tokio::task::JoinHandle<eyre::Result<()>>) {
        let services = ConnectionServices {
            credentials: self.credentials,
            sessions: self.sessions,
            uploads: self.uploads,
            events: self.events,
            router: self.router,
            limits: Limits::from(&self.config),
        };
        let router = api::ws::routes(
            services,
            self.config.ws_max_message_size,
            self.config.handshake_timeout,
            self.shutdown,
        )
        .layer(TraceLayer::new_for_http());
        (router, self.session_sweeper)
    }
}
