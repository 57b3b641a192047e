//! Metrics definitions for the pairing relay.

/// Metrics key for currently registered servers.
pub const METRICS_ID_RELAY_SERVERS: &str = "homelink.relay.servers.registered";
/// Metrics key for currently active pipes.
pub const METRICS_ID_RELAY_PIPES: &str = "homelink.relay.pipes.active";
/// Metrics key for piped bytes (both directions).
pub const METRICS_ID_RELAY_BYTES: &str = "homelink.relay.bytes.piped";
/// Metrics key for rejected pairing attempts.
pub const METRICS_ID_RELAY_REJECTED: &str = "homelink.relay.pairings.rejected";

/// Describe all metrics used by the relay.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_RELAY_SERVERS,
        metrics::Unit::Count,
        "Number of registered server sockets"
    );

    metrics::describe_gauge!(
        METRICS_ID_RELAY_PIPES,
        metrics::Unit::Count,
        "Number of active byte pipes"
    );

    metrics::describe_counter!(
        METRICS_ID_RELAY_BYTES,
        metrics::Unit::Bytes,
        "Number of bytes copied between paired sockets"
    );

    metrics::describe_counter!(
        METRICS_ID_RELAY_REJECTED,
        metrics::Unit::Count,
        "Number of pairing attempts rejected"
    );
}
