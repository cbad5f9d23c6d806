//! # Ingest Gate Server
//!
//! The server side of the streaming ingestion protocol: accepting streams,
//! driving each one through its session state machine, validating and
//! sequencing client batches, and handing them to a downstream
//! [`SessionRouter`](ingest_gate_router::SessionRouter).
//!
//! ## Key Types
//!
//! - [`IngestServer`] - Accept loop, active session set, graceful stop
//! - [`ServerConfig`] - Runtime settings (secret, receipt timestamps, reuse)
//! - [`SessionIdsPool`] - Bounded pool of session ids kept for reconnecting clients
//! - [`Listener`] / [`StreamReader`] / [`StreamWriter`] - Transport seam
//! - [`TcpIngestListener`] - Length-prefixed CBOR over TCP
//!
//! ## Design Notes
//!
//! Each stream is owned by one session task. Transport completions, downstream
//! callbacks, and ingest task results reach it as messages, so the session's
//! state is never shared. Batches are processed by a separate per-session
//! worker, which keeps decoding and submission off the I/O path while
//! preserving per-session order.
//!
//! Every failure path ends in the same finish step, so a client sees
//! exactly one terminal [`Status`](ingest_gate_core::Status).
//!
//! For testing, use [`transport::memory`], an in-process transport with
//! the same semantics as TCP.

pub mod config;
pub mod error;
pub mod pool;
pub mod server;
pub mod tcp;
pub mod transport;

mod session;
mod task;

pub use config::{ReuseConfig, ServerConfig};
pub use error::{IngestError, Result, TransportError};
pub use pool::SessionIdsPool;
pub use server::{IngestServer, ServerCounters};
pub use task::MAX_SUBMIT_BATCH;
pub use tcp::{TcpIngestListener, TcpTransportConfig, DEFAULT_MEMORY_QUOTA};
pub use transport::{Listener, ServerStream, StreamReader, StreamWriter};

/// Route logs to the test harness's captured output.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
