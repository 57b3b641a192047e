//! Configuration for a homelink server.
//!
//! Hosting applications may have a more detailed config and can use the
//! exposed [`ServerConfig`] and flatten it with `#[clap(flatten)]`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// The configuration of the homelink transport server.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`.
#[derive(Parser, Debug, Clone)]
pub struct ServerConfig {
    /// Max message size the websocket connection accepts.
    ///
    /// Must leave room for one envelope around a 64 KiB upload chunk.
    #[clap(long, env = "HOMELINK_SERVER_MAX_MESSAGE_SIZE", default_value = "2097152")]
    pub ws_max_message_size: usize,

    /// Max time a connection may stay unauthenticated before it is closed
    /// with code 4008.
    #[clap(
        long,
        env = "HOMELINK_SERVER_HANDSHAKE_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub handshake_timeout: Duration,

    /// Upper bound on a single application request; exceeded requests are
    /// answered with status 504.
    #[clap(
        long,
        env = "HOMELINK_SERVER_REQUEST_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub request_timeout: Duration,

    /// Max concurrently dispatched requests per connection. Further frames
    /// are simply not read until a slot frees up.
    #[clap(long, env = "HOMELINK_SERVER_MAX_INFLIGHT_REQUESTS", default_value = "32")]
    pub max_inflight_requests: usize,

    /// Depth of the per-connection outbound frame queue. Producers await a
    /// free slot when it is full.
    #[clap(long, env = "HOMELINK_SERVER_OUTBOUND_QUEUE_DEPTH", default_value = "64")]
    pub outbound_queue_depth: usize,

    /// Interval of the per-subscription heartbeat event.
    #[clap(
        long,
        env = "HOMELINK_SERVER_HEARTBEAT_INTERVAL",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub heartbeat_interval: Duration,

    /// Number of events retained per channel for cursor replay. Subscribers
    /// whose cursor fell out of the window start live instead of replaying.
    #[clap(long, env = "HOMELINK_SERVER_EVENT_RETENTION", default_value = "256")]
    pub event_retention: usize,

    /// Time-to-live of resumable sessions, measured from last use.
    #[clap(
        long,
        env = "HOMELINK_SERVER_SESSION_TTL",
        default_value = "30days",
        value_parser = humantime::parse_duration
    )]
    pub session_ttl: Duration,

    /// Max number of resumable sessions kept; the least recently used one is
    /// evicted on overflow.
    #[clap(long, env = "HOMELINK_SERVER_SESSION_CAPACITY", default_value = "1024")]
    pub session_capacity: usize,

    /// Sweep interval of the session eviction task.
    #[clap(
        long,
        env = "HOMELINK_SERVER_SESSION_SWEEP_INTERVAL",
        default_value = "1min",
        value_parser = humantime::parse_duration
    )]
    pub session_sweep_interval: Duration,

    /// Largest accepted declared upload size in bytes.
    #[clap(
        long,
        env = "HOMELINK_SERVER_UPLOAD_QUOTA_BYTES",
        default_value = "536870912"
    )]
    pub upload_quota_bytes: u64,

    /// Concurrent upload write slots across all connections.
    #[clap(long, env = "HOMELINK_SERVER_UPLOAD_SLOTS", default_value = "4")]
    pub upload_slots: usize,

    /// JSON payloads at or above this size are gzip-compressed, provided the
    /// client announced support for it.
    #[clap(
        long,
        env = "HOMELINK_SERVER_COMPRESSION_THRESHOLD",
        default_value = "4096"
    )]
    pub compression_threshold: usize,

    /// Directory holding the credential journal, the session store and
    /// uploaded files.
    #[clap(long, env = "HOMELINK_SERVER_DATA_DIR")]
    pub data_dir: PathBuf,
}
