//! Runtime configuration for the ingest server.

use std::time::Duration;

use ingest_gate_core::DEFAULT_MAX_RECEIVE_MESSAGE_SIZE;
use tracing::Level;

/// Session reuse settings.
#[derive(Debug, Clone)]
pub struct ReuseConfig {
    /// When false, `_reusable` is passed downstream as ordinary meta and
    /// the capability header is not advertised.
    pub enabled: bool,

    /// Maximum number of stashed session ids across all keys.
    pub capacity: usize,
}

impl Default for ReuseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 200,
        }
    }
}

/// Configuration for [`IngestServer`](crate::IngestServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Clients must present this key in `Initialize` when set.
    pub shared_secret_key: Option<String>,

    /// Advertised to clients; enforced by the transport.
    pub max_receive_message_size: usize,

    /// Level for unexpected transport errors.
    pub transport_error_log_level: Level,

    /// Stamp each message with the time its request was read.
    pub set_receipt_timestamp: bool,

    /// Take the receipt timestamp from the `_receipt_timestamp` meta key
    /// when present.
    pub parse_receipt_timestamp_from_meta: bool,

    pub reuse: ReuseConfig,

    /// How long `stop` waits for sessions to wind down.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shared_secret_key: None,
            max_receive_message_size: DEFAULT_MAX_RECEIVE_MESSAGE_SIZE,
            transport_error_log_level: Level::ERROR,
            set_receipt_timestamp: true,
            parse_receipt_timestamp_from_meta: false,
            reuse: ReuseConfig::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}
