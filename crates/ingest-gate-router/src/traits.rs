//! Router traits: the abstract interface to the downstream subsystem.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ingest_gate_core::{SeqItem, SeqNo, SessionId, SessionMeta};

/// Result of starting a downstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartSessionResult {
    /// Session started; the handler has been or will be started.
    Ok,
    /// A session with this id is already running.
    AlreadyStarted,
    /// New-session rate limit reached.
    Throttled,
    /// Any other failure, with a message for the client.
    Error(String),
}

/// How the downstream treats messages of a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultTolerance {
    /// Unacknowledged messages are resent by the client after reconnect.
    #[default]
    ResendOnFailure,
}

/// What the downstream does when its inflight limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InflightAction {
    #[default]
    Drop,
    Block,
    Queue,
}

impl InflightAction {
    pub fn as_str(self) -> &'static str {
        match self {
            InflightAction::Drop => "drop",
            InflightAction::Block => "block",
            InflightAction::Queue => "queue",
        }
    }
}

impl fmt::Display for InflightAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InflightAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(InflightAction::Drop),
            "block" => Ok(InflightAction::Block),
            "queue" => Ok(InflightAction::Queue),
            other => Err(format!("unknown inflight action [{}]", other)),
        }
    }
}

/// Options passed with [`SessionRouter::start_session`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartOptions {
    pub fault_tolerance: FaultTolerance,
    /// Skip the new-session rate limit (set for reused session ids).
    pub ignore_rate_limit: bool,
    pub inflight_action: InflightAction,
}

/// Sink for sequenced messages of one downstream session.
///
/// Implementations must take ownership of the whole batch before
/// returning.
pub trait MessageConsumer: Send + Sync {
    fn submit(&self, batch: Vec<SeqItem>);
}

/// Callbacks the router invokes on a started session.
pub trait SessionHandler: Send + Sync {
    /// The downstream is ready; messages above `last_seq_no` are expected.
    fn start(&self, last_seq_no: SeqNo, consumer: Arc<dyn MessageConsumer>);

    /// Everything up to and including `seq_no` is durable downstream.
    fn ack(&self, seq_no: SeqNo);
}

/// The downstream session-routing subsystem.
#[async_trait]
pub trait SessionRouter: Send + Sync {
    /// Start a downstream session.
    ///
    /// On `Ok` the router calls [`SessionHandler::start`], possibly before
    /// returning.
    fn start_session(
        &self,
        id: &SessionId,
        meta: SessionMeta,
        handler: Arc<dyn SessionHandler>,
        options: StartOptions,
    ) -> StartSessionResult;

    /// Stop a downstream session. `force` skips graceful draining.
    async fn stop_session(&self, id: &SessionId, force: bool);
}
