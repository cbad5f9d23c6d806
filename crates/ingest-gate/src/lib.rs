//! # Ingest Gate
//!
//! A streaming ingestion gateway. Clients open a stream, initialize a
//! session, push batches of sequenced messages, and receive acks as the
//! downstream accepts them. Reconnecting clients can get their session
//! back without paying the new-session rate limit.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ingest_gate::{AgentConfig, IngestAgent};
//! use ingest_gate::router::MemoryRouter;
//!
//! async fn example() {
//!     let config = AgentConfig::load("ingest-gate.json").unwrap();
//!     let agent = IngestAgent::start(config, Arc::new(MemoryRouter::new()))
//!         .await
//!         .unwrap();
//!
//!     // ... serve until shutdown is requested ...
//!
//!     agent.stop().await;
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `ingest_gate::core` - Sessions, sequence numbers, wire frames
//! - `ingest_gate::router` - The downstream boundary
//! - `ingest_gate::server` - Session state machine, transports, reuse pool

pub mod agent;
pub mod config;
pub mod error;

pub use ingest_gate_core as core;
pub use ingest_gate_router as router;
pub use ingest_gate_server as server;

pub use agent::IngestAgent;
pub use config::{AgentConfig, DataSize, EnvOverrides, LogLevel, SecretSource};
pub use error::{ConfigError, GateError, Result};

pub use ingest_gate_core::{Request, Response, SeqNo, SessionId, Status, StatusCode};
pub use ingest_gate_server::{IngestServer, ServerConfig, ServerCounters};
