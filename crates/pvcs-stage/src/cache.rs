//! Memoization of materialized commit values.

use parking_lot::RwLock;
use pvcs_meta::CommitId;
use pvcs_store::Hash;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    eval: String,
    causal: Hash,
    commit: CommitId,
}

/// Cache of materialized commit values, keyed by
/// `(evaluator identity, causal-order identity, commit id)`.
///
/// The causal component is a content address, so the cache is safe to
/// share across repositories that happen to hold the same commits.
/// Entries are pure functions of their keys, which makes the cache
/// append-only: a key's value never changes once written, and concurrent
/// readers and writers need no coordination beyond the map lock.
///
/// Owned by a stage rather than process-global so one session's
/// evaluator cannot leak values into another.
#[derive(Default)]
pub struct CommitValueCache {
    entries: RwLock<HashMap<CacheKey, Value>>,
}

impl CommitValueCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached value.
    pub fn get(&self, eval: &str, causal: &Hash, commit: &CommitId) -> Option<Value> {
        self.entries
            .read()
            .get(&CacheKey {
                eval: eval.to_string(),
                causal: *causal,
                commit: *commit,
            })
            .cloned()
    }

    /// Record a value. The first write for a key wins; later writes for
    /// the same key carry the same value by construction and are
    /// dropped.
    pub fn insert(&self, eval: &str, causal: &Hash, commit: &CommitId, value: Value) {
        self.entries
            .write()
            .entry(CacheKey {
                eval: eval.to_string(),
                causal: *causal,
                commit: *commit,
            })
            .or_insert(value);
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key_parts() -> (Hash, CommitId) {
        (Hash::digest(b"causal"), Hash::digest(b"commit"))
    }

    #[test]
    fn hit_and_miss() {
        let cache = CommitValueCache::new();
        let (causal, commit) = key_parts();

        assert!(cache.get("eval-1", &causal, &commit).is_none());

        cache.insert("eval-1", &causal, &commit, json!({"a": 1}));
        assert_eq!(
            cache.get("eval-1", &causal, &commit),
            Some(json!({"a": 1}))
        );
    }

    #[test]
    fn keys_disambiguate_evaluators() {
        let cache = CommitValueCache::new();
        let (causal, commit) = key_parts();

        cache.insert("eval-1", &causal, &commit, json!(1));
        cache.insert("eval-2", &causal, &commit, json!(2));

        assert_eq!(cache.get("eval-1", &causal, &commit), Some(json!(1)));
        assert_eq!(cache.get("eval-2", &causal, &commit), Some(json!(2)));
    }

    #[test]
    fn first_write_wins() {
        let cache = CommitValueCache::new();
        let (causal, commit) = key_parts();

        cache.insert("eval-1", &causal, &commit, json!(1));
        cache.insert("eval-1", &causal, &commit, json!(2));

        assert_eq!(cache.get("eval-1", &causal, &commit), Some(json!(1)));
        assert_eq!(cache.len(), 1);
    }
}
