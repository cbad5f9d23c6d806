//! Messages: the unit of downstream submission.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::SeqNo;

/// Session-level metadata supplied with `Initialize`.
///
/// Ordered so that derived keys are deterministic.
pub type SessionMeta = BTreeMap<String, String>;

/// Reserved session meta flag opting a session into id reuse.
pub const REUSABLE_META_KEY: &str = "_reusable";

/// Reserved message meta key carrying a receipt timestamp override (µs).
pub const RECEIPT_TIMESTAMP_META_KEY: &str = "_receipt_timestamp";

/// A single message accepted from a client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Opaque payload.
    pub payload: Bytes,
    /// Producer timestamp, microseconds since the Unix epoch.
    pub timestamp_us: u64,
    /// When the gateway received the message, microseconds since the Unix epoch.
    pub receipt_timestamp_us: Option<u64>,
    /// Per-message metadata.
    pub meta: BTreeMap<String, String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, timestamp_us: u64) -> Self {
        Self {
            payload: payload.into(),
            timestamp_us,
            receipt_timestamp_us: None,
            meta: BTreeMap::new(),
        }
    }
}

/// A message paired with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqItem {
    pub seq_no: SeqNo,
    pub message: Message,
}

/// Key under which a reusable session id is stashed.
///
/// Derived from all session meta entries (the `_reusable` flag already
/// removed) as `k1=v1,k2=v2` in key order. A backslash, `=` or `,` inside
/// a key or value is escaped with a backslash. Not an identity: several
/// sessions may share one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReuseKey(String);

impl ReuseKey {
    /// Derive the key from session meta.
    pub fn derive(meta: &SessionMeta) -> Self {
        let mut key = String::new();
        for (i, (k, v)) in meta.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            push_escaped(&mut key, k);
            key.push('=');
            push_escaped(&mut key, v);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn push_escaped(out: &mut String, part: &str) {
    for c in part.chars() {
        if matches!(c, '\\' | '=' | ',') {
            out.push('\\');
        }
        out.push(c);
    }
}

impl fmt::Display for ReuseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReuseKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
