//! Core services that make up a homelink server.
//!
//! This module exposes all internal services used by the transport to handle
//! credentials, resumable sessions, uploads and event fan-out. Each service
//! encapsulates a specific responsibility and can be used by higher-level
//! components such as the websocket endpoint or the hosting application.
//!
//! # Services overview
//!
//! - [`credential_store`] – journal-backed store of SRP salt/verifier pairs.
//! - [`session_store`] – durable map of resumable sessions and proof checks.
//! - [`upload_store`] – chunk files with atomic promotion on completion.
//! - [`event_hub`] – per-channel event log with cursor replay and fan-out.

pub mod credential_store;
pub mod event_hub;
pub mod session_store;
pub mod upload_store;

/// Filesystem-level failures of the persistent stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying IO failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A persisted record could not be (de)serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
