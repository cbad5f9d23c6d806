//! Error types for the ingest server.

use ingest_gate_core::{CodecError, DecodeError, Status, StatusCode};
use thiserror::Error;

/// Why a session's ingest pipeline stopped processing.
///
/// Every variant except [`IngestError::Poisoned`] is a protocol violation
/// and maps one-to-one onto a terminal [`Status`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    /// Malformed request, batch, or metadata.
    #[error("{0}")]
    InvalidArgument(String),

    /// Out-of-order sequence number, request before start, or a
    /// downstream start failure.
    #[error("{0}")]
    FailedPrecondition(String),

    /// The downstream already runs a session with this id.
    #[error("{0}")]
    AlreadyExists(String),

    /// Shared secret mismatch.
    #[error("{0}")]
    PermissionDenied(String),

    /// New-session rate limit reached.
    #[error("{0}")]
    ResourceExhausted(String),

    /// A local invariant broke.
    #[error("{0}")]
    Internal(String),

    /// The client sent the poison pill on a reusable session.
    #[error("poisoned")]
    Poisoned,
}

impl IngestError {
    pub fn code(&self) -> StatusCode {
        match self {
            IngestError::InvalidArgument(_) => StatusCode::InvalidArgument,
            IngestError::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            IngestError::AlreadyExists(_) => StatusCode::AlreadyExists,
            IngestError::PermissionDenied(_) => StatusCode::PermissionDenied,
            IngestError::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            IngestError::Internal(_) => StatusCode::Internal,
            IngestError::Poisoned => StatusCode::Cancelled,
        }
    }

    /// The terminal status sent to the client.
    pub fn status(&self) -> Status {
        Status::new(self.code(), self.to_string())
    }
}

impl From<DecodeError> for IngestError {
    fn from(err: DecodeError) -> Self {
        IngestError::InvalidArgument(err.to_string())
    }
}

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The stream was cancelled locally or by the peer.
    #[error("stream cancelled")]
    Cancelled,

    /// The peer went away without closing its side gracefully.
    #[error("peer disconnected")]
    Disconnected,

    #[error("received message larger than max ({size} vs. {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The listener or stream is closed.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the error means the peer is gone, as opposed to a fault.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Cancelled | TransportError::Disconnected)
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::FrameTooLarge { size, max } => TransportError::FrameTooLarge { size, max },
            other => TransportError::Malformed(other.to_string()),
        }
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
