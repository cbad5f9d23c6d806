//! # Ingest Gate Router
//!
//! The downstream boundary of the ingest gateway. Accepted messages leave
//! the gateway through the [`SessionRouter`] trait, which starts and stops
//! downstream sessions and hands each one a [`MessageConsumer`].
//!
//! ## Key Types
//!
//! - [`SessionRouter`] - Starts and stops downstream sessions
//! - [`SessionHandler`] - Callbacks the router invokes on a started session
//! - [`MessageConsumer`] - Synchronous sink for sequenced messages
//! - [`MemoryRouter`] - In-memory router for tests and embedding
//!
//! ## Flow
//!
//! ```text
//! gateway                         router
//!   |-- start_session(id, handler) -->|
//!   |<-- handler.start(last, consumer)|
//!   |-- consumer.submit(batch) ------>|
//!   |<-- handler.ack(seq_no) ---------|
//!   |-- stop_session(id, force) ----->|
//! ```
//!
//! ## Design Notes
//!
//! - **Synchronous submit**: `submit` returns only after the batch is taken.
//!   The gateway never suspends a submission.
//! - **Drop on overload**: the gateway requires [`InflightAction::Drop`];
//!   a router must never block the gateway's task on admission.

pub mod memory;
pub mod traits;

pub use memory::{MemoryConsumer, MemoryRouter, MemoryRouterConfig, StopRecord};
pub use traits::{
    FaultTolerance, InflightAction, MessageConsumer, SessionHandler, SessionRouter, StartOptions,
    StartSessionResult,
};
