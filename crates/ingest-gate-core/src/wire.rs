//! Wire message types.
//!
//! Transport-agnostic: framing belongs to the transport. A client sends one
//! [`Initialize`] followed by any number of [`DataBatch`]es; the server
//! answers with one `Initialized` and a strictly increasing series of
//! `Ack`s, and ends the stream with a single [`Status`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Header advertising that the server supports session reuse.
pub const HEADER_REUSE_SESSIONS: &str = "x-ingest-reuse-sessions";

/// Header advertising the largest request the server accepts, in bytes.
pub const HEADER_MAX_RECEIVE_MESSAGE_SIZE: &str = "x-ingest-max-receive-message-size";

/// Out-of-band stream metadata sent by the server before any response.
pub type Headers = BTreeMap<String, String>;

/// Client → server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Must be the first message of a stream.
    Initialize(Initialize),
    /// A batch of messages.
    DataBatch(DataBatch),
}

impl Request {
    /// Short name used in logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Initialize(_) => "Initialize",
            Request::DataBatch(_) => "DataBatch",
        }
    }
}

/// Session opening request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Initialize {
    /// Empty for a new session; set to resume a known one.
    pub session_id: String,
    /// Must match the server's shared secret when one is configured.
    pub shared_secret_key: String,
    /// Session metadata; later duplicates of a name win.
    pub meta: Vec<MetaPair>,
}

/// One session meta entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaPair {
    pub name: String,
    pub value: String,
}

impl MetaPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A batch of messages as parallel arrays.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataBatch {
    pub seq_no: Vec<u64>,
    /// Producer timestamps, microseconds.
    pub timestamp: Vec<u64>,
    pub payload: Vec<Bytes>,
    /// Per-message metadata, column-wise.
    pub meta: Vec<MetaColumn>,
}

impl DataBatch {
    /// Number of messages claimed by the sequence array.
    pub fn len(&self) -> usize {
        self.seq_no.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq_no.is_empty()
    }

    /// Total payload bytes.
    pub fn payload_bytes(&self) -> usize {
        self.payload.iter().map(Bytes::len).sum()
    }
}

/// One metadata key across a batch, skip-run-length encoded.
///
/// `value[i]` belongs to the i-th message that is not covered by a skip
/// run; `skip_start[j]`/`skip_length[j]` name a run of messages with no
/// value for this key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaColumn {
    pub key: String,
    pub value: Vec<String>,
    pub skip_start: Vec<u32>,
    pub skip_length: Vec<u32>,
}

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Sent once, after the downstream session has started.
    Initialized { session_id: String, last_seq_no: u64 },
    /// Everything up to and including `seq_no` is accepted.
    Ack { seq_no: u64 },
}

/// Terminal status codes, numbered like their gRPC counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Internal = 13,
    Unavailable = 14,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single terminal status of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code [{}], message [{}]", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let status = Status::new(StatusCode::FailedPrecondition, "seqNo [5] is stale");
        assert_eq!(
            status.to_string(),
            "code [FAILED_PRECONDITION], message [seqNo [5] is stale]"
        );
        assert!(!status.is_ok());
        assert!(Status::ok().is_ok());
    }

    #[test]
    fn test_status_code_numbering() {
        assert_eq!(StatusCode::Cancelled as u16, 1);
        assert_eq!(StatusCode::FailedPrecondition as u16, 9);
        assert_eq!(StatusCode::Unavailable as u16, 14);
    }

    #[test]
    fn test_batch_payload_bytes() {
        let batch = DataBatch {
            seq_no: vec![1, 2],
            timestamp: vec![10, 20],
            payload: vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")],
            meta: vec![],
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.payload_bytes(), 5);
    }
}
