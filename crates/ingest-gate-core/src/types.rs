//! Strong type definitions for the ingest gateway.
//!
//! Identifiers are newtypes to prevent mixing a session id with an
//! arbitrary string, or a sequence number with a count.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of one logical ingestion session.
///
/// Supplied by a resuming client, drawn from the reuse pool, or generated.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier (128 bits, hex).
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    /// The empty id, meaning "not supplied".
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-session sequence number.
///
/// Strictly increasing within a session. `u64::MAX` is reserved as the
/// poison pill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SeqNo(pub u64);

impl SeqNo {
    /// Nothing acknowledged yet.
    pub const ZERO: Self = Self(0);

    /// Client-initiated reset of a reusable session.
    pub const POISON_PILL: Self = Self(u64::MAX);

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_poison_pill(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SeqNo {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_session_ids_differ() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId::from("abc");
        assert_eq!(format!("{}", id), "abc");
        assert_eq!(format!("{:?}", id), "SessionId(abc)");
    }

    #[test]
    fn test_seq_no_poison_pill() {
        assert!(SeqNo::POISON_PILL.is_poison_pill());
        assert!(!SeqNo(7).is_poison_pill());
        assert!(SeqNo(7) > SeqNo::ZERO);
    }
}
