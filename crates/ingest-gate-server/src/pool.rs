//! Session id reuse pool.
//!
//! Clients that opt in with `_reusable=true` and later reconnect without a
//! session id get their previous id back, which lets them skip the
//! new-session rate limit. Ids enter the pool only when a reusable session
//! ends by client cancellation.
//!
//! The pool is bounded. Entries are numbered by a monotonically increasing
//! counter; the ordered map over that counter gives global insertion order
//! for eviction, and per-key deques give most-recent-first reuse.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ingest_gate_core::{ReuseKey, SessionId, SessionMeta, REUSABLE_META_KEY};
use tracing::info;

use crate::config::ReuseConfig;

/// Bounded store of reusable session ids keyed by [`ReuseKey`].
pub struct SessionIdsPool {
    config: ReuseConfig,
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    /// Global insertion order: position -> entry.
    order: BTreeMap<u64, PoolEntry>,

    /// Positions per key, oldest first.
    by_key: HashMap<ReuseKey, VecDeque<u64>>,

    next_position: u64,
}

struct PoolEntry {
    key: ReuseKey,
    id: SessionId,
}

impl PoolInner {
    /// Remove the newest entry stashed under `key`.
    fn pop_newest(&mut self, key: &ReuseKey) -> Option<PoolEntry> {
        let positions = self.by_key.get_mut(key)?;
        let position = positions.pop_back();
        if positions.is_empty() {
            self.by_key.remove(key);
        }
        self.order.remove(&position?)
    }

    /// Remove the globally oldest entry. It is also the oldest of its key.
    fn pop_oldest(&mut self) -> Option<PoolEntry> {
        let (position, entry) = self.order.pop_first()?;
        if let Some(positions) = self.by_key.get_mut(&entry.key) {
            let front = positions.pop_front();
            debug_assert_eq!(front, Some(position));
            if positions.is_empty() {
                self.by_key.remove(&entry.key);
            }
        }
        Some(entry)
    }
}

impl SessionIdsPool {
    pub fn new(config: ReuseConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Whether reuse is honored at all.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Number of stashed ids.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the `_reusable` flag off `meta` and derive the reuse key.
    ///
    /// Returns a key only when reuse is enabled and the flag is exactly
    /// `"true"`. When reuse is disabled the flag is left in place.
    pub fn try_extract_reuse_key(&self, meta: &mut SessionMeta) -> Option<ReuseKey> {
        if !self.config.enabled {
            return None;
        }
        let flag = meta.remove(REUSABLE_META_KEY)?;
        if flag != "true" {
            return None;
        }
        Some(ReuseKey::derive(meta))
    }

    /// Take the most recently stashed id for `key`.
    pub fn try_reuse(&self, key: &ReuseKey) -> Option<SessionId> {
        let entry = self.lock().pop_newest(key)?;
        info!(session_id = %entry.id, key = %key, "reused session id");
        Some(entry.id)
    }

    /// Stash `id` under `key`, evicting the globally oldest entry when the
    /// pool overflows.
    pub fn stash(&self, id: SessionId, key: ReuseKey) {
        let mut inner = self.lock();
        let position = inner.next_position;
        inner.next_position += 1;
        inner.by_key.entry(key.clone()).or_default().push_back(position);
        inner.order.insert(
            position,
            PoolEntry {
                key: key.clone(),
                id: id.clone(),
            },
        );

        while inner.order.len() > self.config.capacity {
            let Some(evicted) = inner.pop_oldest() else {
                break;
            };
            info!(session_id = %evicted.id, key = %evicted.key, "evicted session id");
        }
        drop(inner);

        info!(session_id = %id, key = %key, "stashed session id");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool(capacity: usize) -> SessionIdsPool {
        SessionIdsPool::new(ReuseConfig {
            enabled: true,
            capacity,
        })
    }

    fn meta(pairs: &[(&str, &str)]) -> SessionMeta {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_reuse_key() {
        let pool = pool(10);
        let mut m = meta(&[("_reusable", "true"), ("k", "v"), ("app", "web")]);
        let key = pool.try_extract_reuse_key(&mut m).unwrap();
        assert_eq!(key.as_str(), "app=web,k=v");
        assert!(!m.contains_key("_reusable"));
    }

    #[test]
    fn test_extract_flag_not_true() {
        let pool = pool(10);
        let mut m = meta(&[("_reusable", "yes"), ("k", "v")]);
        assert!(pool.try_extract_reuse_key(&mut m).is_none());
        assert_eq!(m, meta(&[("k", "v")]));

        let mut m = meta(&[("k", "v")]);
        assert!(pool.try_extract_reuse_key(&mut m).is_none());
    }

    #[test]
    fn test_extract_disabled() {
        let pool = SessionIdsPool::new(ReuseConfig {
            enabled: false,
            capacity: 10,
        });
        let mut m = meta(&[("_reusable", "true")]);
        assert!(pool.try_extract_reuse_key(&mut m).is_none());
    }

    #[test]
    fn test_reuse_empty_or_unknown() {
        let pool = pool(10);
        assert!(pool.try_reuse(&ReuseKey::from("k=v")).is_none());
        pool.stash(SessionId::from("a"), ReuseKey::from("k=v"));
        assert!(pool.try_reuse(&ReuseKey::from("k=w")).is_none());
    }

    #[test]
    fn test_most_recent_stash_wins() {
        let pool = pool(10);
        let key = ReuseKey::from("k=v");
        pool.stash(SessionId::from("first"), key.clone());
        pool.stash(SessionId::from("second"), key.clone());

        assert_eq!(pool.try_reuse(&key), Some(SessionId::from("second")));
        assert_eq!(pool.try_reuse(&key), Some(SessionId::from("first")));
        assert_eq!(pool.try_reuse(&key), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_evicts_globally_oldest() {
        let pool = pool(2);
        pool.stash(SessionId::from("A"), ReuseKey::from("a"));
        pool.stash(SessionId::from("B"), ReuseKey::from("b"));
        pool.stash(SessionId::from("C"), ReuseKey::from("c"));

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.try_reuse(&ReuseKey::from("a")), None);
        assert_eq!(pool.try_reuse(&ReuseKey::from("b")), Some(SessionId::from("B")));
        assert_eq!(pool.try_reuse(&ReuseKey::from("c")), Some(SessionId::from("C")));
    }

    #[test]
    fn test_eviction_within_shared_key() {
        let pool = pool(2);
        let key = ReuseKey::from("k=v");
        pool.stash(SessionId::from("1"), key.clone());
        pool.stash(SessionId::from("2"), key.clone());
        pool.stash(SessionId::from("3"), key.clone());

        assert_eq!(pool.try_reuse(&key), Some(SessionId::from("3")));
        assert_eq!(pool.try_reuse(&key), Some(SessionId::from("2")));
        assert_eq!(pool.try_reuse(&key), None);
    }

    #[test]
    fn test_reuse_frees_capacity() {
        let pool = pool(2);
        pool.stash(SessionId::from("A"), ReuseKey::from("a"));
        pool.stash(SessionId::from("B"), ReuseKey::from("b"));
        assert!(pool.try_reuse(&ReuseKey::from("a")).is_some());
        pool.stash(SessionId::from("C"), ReuseKey::from("c"));

        assert_eq!(pool.try_reuse(&ReuseKey::from("b")), Some(SessionId::from("B")));
        assert_eq!(pool.try_reuse(&ReuseKey::from("c")), Some(SessionId::from("C")));
    }

    fn assert_indexes_agree(pool: &SessionIdsPool) {
        let inner = pool.lock();
        let indexed: usize = inner.by_key.values().map(VecDeque::len).sum();
        assert_eq!(indexed, inner.order.len());
        for (key, positions) in &inner.by_key {
            assert!(!positions.is_empty());
            assert!(positions.iter().zip(positions.iter().skip(1)).all(|(a, b)| a < b));
            for position in positions {
                assert_eq!(&inner.order[position].key, key);
            }
        }
    }

    proptest! {
        #[test]
        fn test_interleaved_stash_and_reuse(
            capacity in 1usize..6,
            ops in prop::collection::vec((any::<bool>(), 0u8..3), 0..60),
        ) {
            let pool = pool(capacity);
            // Oldest first.
            let mut model: Vec<(String, u8)> = Vec::new();
            for (i, (stash, k)) in ops.into_iter().enumerate() {
                let key = ReuseKey::from(format!("k{}", k).as_str());
                if stash {
                    pool.stash(SessionId::new(i.to_string()), key);
                    model.push((i.to_string(), k));
                    if model.len() > capacity {
                        model.remove(0);
                    }
                } else {
                    let expected = model
                        .iter()
                        .rposition(|(_, mk)| *mk == k)
                        .map(|at| model.remove(at).0);
                    let got = pool.try_reuse(&key).map(|id| id.as_str().to_string());
                    prop_assert_eq!(got, expected);
                }
                prop_assert_eq!(pool.len(), model.len());
                assert_indexes_agree(&pool);
            }
        }

        #[test]
        fn test_pool_keeps_newest_entries(
            capacity in 1usize..8,
            keys in prop::collection::vec(0u8..4, 0..40),
        ) {
            let pool = pool(capacity);
            for (i, k) in keys.iter().enumerate() {
                pool.stash(SessionId::new(i.to_string()), ReuseKey::from(format!("k{}", k).as_str()));
                prop_assert!(pool.len() <= capacity);
            }

            // Survivors are exactly the last `capacity` stashes.
            let start = keys.len().saturating_sub(capacity);
            let mut expected: Vec<String> = (start..keys.len()).map(|i| i.to_string()).collect();
            let mut found = Vec::new();
            for k in 0u8..4 {
                let key = ReuseKey::from(format!("k{}", k).as_str());
                while let Some(id) = pool.try_reuse(&key) {
                    found.push(id.as_str().to_string());
                }
            }
            expected.sort();
            found.sort();
            prop_assert_eq!(found, expected);
        }
    }
}
