//! # Ingest Gate Core
//!
//! Pure primitives for the ingest gateway: session identity, sequence
//! numbers, messages, and the wire frames exchanged with clients.
//!
//! This crate contains no I/O, no scheduling, no networking. It is pure
//! computation over the data model shared by the transport, the session
//! state machine, and the downstream router.
//!
//! ## Key Types
//!
//! - [`SessionId`] - Opaque identifier of one logical ingestion session
//! - [`SeqNo`] - Per-session monotonic counter (with the [`SeqNo::POISON_PILL`] sentinel)
//! - [`Message`] / [`SeqItem`] - The unit handed to the downstream consumer
//! - [`Request`] / [`Response`] - Client and server wire messages
//! - [`Status`] / [`StatusCode`] - The terminal status of a stream
//!
//! ## Metadata Encoding
//!
//! Per-message metadata travels column-wise with skip-run-length encoding.
//! See the [`meta`] module.
//!
//! ## Framing
//!
//! Stream transports that need their own framing use length-prefixed CBOR.
//! See the [`codec`] module.

pub mod codec;
pub mod error;
pub mod message;
pub mod meta;
pub mod types;
pub mod wire;

pub use codec::{
    decode_frame_body, encode_frame, frame_body_len, ClientFrame, ServerFrame,
    DEFAULT_MAX_RECEIVE_MESSAGE_SIZE, FRAME_HEADER_LEN,
};
pub use error::{CodecError, DecodeError};
pub use message::{
    Message, ReuseKey, SeqItem, SessionMeta, RECEIPT_TIMESTAMP_META_KEY, REUSABLE_META_KEY,
};
pub use meta::{decode_meta, encode_meta};
pub use types::{SeqNo, SessionId};
pub use wire::{
    DataBatch, Headers, Initialize, MetaColumn, MetaPair, Request, Response, Status, StatusCode,
    HEADER_MAX_RECEIVE_MESSAGE_SIZE, HEADER_REUSE_SESSIONS,
};
