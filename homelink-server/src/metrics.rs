//! Metrics definitions for the homelink server.
//!
//! This module defines all metrics keys used by the transport and provides
//! a helper [`describe_metrics`] to set metadata for each metric using the
//! `metrics` crate.

/// Metrics key for currently open connections.
pub const METRICS_ID_CONNECTIONS_OPEN: &str = "homelink.server.connections.open";
/// Metrics key for completed SRP handshakes.
pub const METRICS_ID_HANDSHAKES_OK: &str = "homelink.server.handshakes.ok";
/// Metrics key for failed SRP handshakes.
pub const METRICS_ID_HANDSHAKES_FAILED: &str = "homelink.server.handshakes.failed";
/// Metrics key for successful session resumes.
pub const METRICS_ID_RESUMES_OK: &str = "homelink.server.resumes.ok";
/// Metrics key for rejected session resumes.
pub const METRICS_ID_RESUMES_FAILED: &str = "homelink.server.resumes.failed";
/// Metrics key for requests currently dispatched to the router.
pub const METRICS_ID_REQUESTS_INFLIGHT: &str = "homelink.server.requests.inflight";
/// Metrics key for events published to the hub.
pub const METRICS_ID_EVENTS_PUBLISHED: &str = "homelink.server.events.published";
/// Metrics key for retained events dropped from a channel ring on overflow.
pub const METRICS_ID_EVENTS_DROPPED: &str = "homelink.server.events.dropped";
/// Metrics key for upload bytes written.
pub const METRICS_ID_UPLOAD_BYTES: &str = "homelink.server.upload.bytes";
/// Metrics key for sessions evicted by TTL or overflow.
pub const METRICS_ID_SESSIONS_EVICTED: &str = "homelink.server.sessions.evicted";

/// Describe all metrics used by the server.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_CONNECTIONS_OPEN,
        metrics::Unit::Count,
        "Number of open websocket connections"
    );

    metrics::describe_counter!(
        METRICS_ID_HANDSHAKES_OK,
        metrics::Unit::Count,
        "Number of handshakes that reached the authenticated state"
    );

    metrics::describe_counter!(
        METRICS_ID_HANDSHAKES_FAILED,
        metrics::Unit::Count,
        "Number of handshakes that failed or timed out"
    );

    metrics::describe_counter!(
        METRICS_ID_RESUMES_OK,
        metrics::Unit::Count,
        "Number of successful session resumes"
    );

    metrics::describe_counter!(
        METRICS_ID_RESUMES_FAILED,
        metrics::Unit::Count,
        "Number of rejected session resumes"
    );

    metrics::describe_gauge!(
        METRICS_ID_REQUESTS_INFLIGHT,
        metrics::Unit::Count,
        "Number of requests currently dispatched to the application router"
    );

    metrics::describe_counter!(
        METRICS_ID_EVENTS_PUBLISHED,
        metrics::Unit::Count,
        "Number of events published to the event hub"
    );

    metrics::describe_counter!(
        METRICS_ID_EVENTS_DROPPED,
        metrics::Unit::Count,
        "Number of retained events evicted from a channel ring on overflow"
    );

    metrics::describe_counter!(
        METRICS_ID_UPLOAD_BYTES,
        metrics::Unit::Bytes,
        "Number of upload bytes appended to the store"
    );

    metrics::describe_counter!(
        METRICS_ID_SESSIONS_EVICTED,
        metrics::Unit::Count,
        "Number of resumable sessions evicted by TTL or capacity"
    );
}
