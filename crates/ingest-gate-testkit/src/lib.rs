//! # Ingest Gate Testkit
//!
//! Testing utilities for the ingest gateway.
//!
//! ## Overview
//!
//! - **Fixtures**: an in-memory server plus a protocol-speaking client
//! - **Generators**: Proptest strategies for batches and metadata
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use ingest_gate_testkit::TestHarness;
//!
//! async fn example() {
//!     let harness = TestHarness::new();
//!     let mut client = harness.connect().await;
//!     client.initialize("", &[]);
//!     client.send_batch(&[1, 2]);
//!
//!     let (_session_id, last_seq_no) = client.expect_initialized().await;
//!     assert_eq!(last_seq_no.value(), 0);
//!     assert_eq!(client.expect_ack().await.value(), 2);
//!     harness.stop().await;
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use ingest_gate_testkit::StreamParams;
//!
//! proptest! {
//!     #[test]
//!     fn batches_are_well_formed(params: StreamParams) {
//!         prop_assert_eq!(params.requests().len(), params.batch_sizes.len());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{batch_request, init_request, init_tracing, TestClient, TestHarness, TIMEOUT};
pub use generators::StreamParams;
