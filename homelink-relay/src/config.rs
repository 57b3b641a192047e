//! Configuration for the pairing relay.

use std::time::Duration;

use clap::Parser;

/// The configuration of the homelink pairing relay.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`.
#[derive(Parser, Debug, Clone)]
pub struct RelayConfig {
    /// Max message size the websocket connections accept. Piped frames are
    /// opaque, so this bounds memory per frame, nothing else.
    #[clap(long, env = "HOMELINK_RELAY_MAX_MESSAGE_SIZE", default_value = "2097152")]
    pub ws_max_message_size: usize,

    /// How long a fresh socket may stay silent before its role frame must
    /// have arrived.
    #[clap(
        long,
        env = "HOMELINK_RELAY_ROLE_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub role_timeout: Duration,

    /// How long the registered server has to acknowledge a pairing before
    /// the client is told `server_offline`.
    #[clap(
        long,
        env = "HOMELINK_RELAY_PAIR_ACK_TIMEOUT",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    pub pair_ack_timeout: Duration,

    /// Max pair setups per username per minute.
    #[clap(long, env = "HOMELINK_RELAY_PAIRS_PER_MINUTE", default_value = "6")]
    pub pairs_per_minute: u32,

    /// Max piped bytes per username per minute. Exceeding the budget tears
    /// the pipe down with a policy close.
    #[clap(
        long,
        env = "HOMELINK_RELAY_BYTES_PER_MINUTE",
        default_value = "104857600"
    )]
    pub bytes_per_minute: u64,
}
