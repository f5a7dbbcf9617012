//! The commit DAG as a parent map.
//!
//! Each commit maps to the parent list of its commit object. Parent order
//! is part of the content-addressed commit, so enumeration is
//! deterministic across peers without any re-sorting here.

use pvcs_store::{Hash, Hasher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Content address of a commit object.
pub type CommitId = Hash;

/// The causal order: `commit-id → parents`.
///
/// Acyclic by construction (a commit can only reference already-hashed
/// parents). A commit with more than one parent is a merge.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalOrder {
    parents: BTreeMap<CommitId, Vec<CommitId>>,
}

impl CausalOrder {
    /// Create an empty causal order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a commit and its parents.
    ///
    /// Idempotent for content-addressed input: re-inserting the same
    /// commit carries the same parent vector.
    pub fn insert(&mut self, commit: CommitId, parents: Vec<CommitId>) {
        self.parents.entry(commit).or_insert(parents);
    }

    /// Check whether a commit is present.
    pub fn contains(&self, commit: &CommitId) -> bool {
        self.parents.contains_key(commit)
    }

    /// Parents of a commit, in commit-object order. Empty for roots and
    /// unknown commits.
    pub fn parents(&self, commit: &CommitId) -> &[CommitId] {
        self.parents
            .get(commit)
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    /// Number of commits.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Check if the order is empty.
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Iterate all commit ids in byte order.
    pub fn commits(&self) -> impl Iterator<Item = &CommitId> {
        self.parents.keys()
    }

    /// Iterate `(commit, parents)` entries in byte order.
    pub fn iter(&self) -> impl Iterator<Item = (&CommitId, &Vec<CommitId>)> {
        self.parents.iter()
    }

    /// Transitive ancestors of a commit, excluding the commit itself.
    pub fn ancestors(&self, commit: &CommitId) -> BTreeSet<CommitId> {
        let mut result = BTreeSet::new();
        let mut queue: VecDeque<CommitId> = self.parents(commit).iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            if result.insert(current) {
                queue.extend(self.parents(&current).iter().copied());
            }
        }

        result
    }

    /// Union with another causal order.
    ///
    /// Commit contents are content-addressed, so entries present on both
    /// sides are identical; the union keeps the existing entry.
    pub fn union(&self, other: &CausalOrder) -> CausalOrder {
        let mut merged = self.clone();
        for (commit, parents) in &other.parents {
            merged.insert(*commit, parents.clone());
        }
        merged
    }

    /// Fraction of commits that are merges.
    pub fn merge_ratio(&self) -> f64 {
        if self.parents.is_empty() {
            return 0.0;
        }
        let merges = self.parents.values().filter(|p| p.len() > 1).count();
        merges as f64 / self.parents.len() as f64
    }

    /// Content address of the whole order.
    ///
    /// Hashes entries in key order, one field per commit and one for
    /// its concatenated parent ids, so the identity is canonical for a
    /// given set of commits. Used as the causal component of
    /// commit-value cache keys.
    pub fn content_hash(&self) -> Hash {
        let mut hasher = Hasher::new();
        for (commit, parents) in &self.parents {
            hasher.field(commit.as_bytes());
            let mut parent_bytes = Vec::with_capacity(parents.len() * 32);
            for parent in parents {
                parent_bytes.extend_from_slice(parent.as_bytes());
            }
            hasher.field(&parent_bytes);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> CommitId {
        Hash::digest(&[n])
    }

    #[test]
    fn insert_and_query() {
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);

        assert_eq!(causal.len(), 2);
        assert!(causal.contains(&id(1)));
        assert_eq!(causal.parents(&id(1)), &[id(0)]);
        assert!(causal.parents(&id(0)).is_empty());
        assert!(causal.parents(&id(9)).is_empty());
    }

    #[test]
    fn ancestors_are_transitive_and_exclusive() {
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);
        causal.insert(id(2), vec![id(1)]);

        let ancestors = causal.ancestors(&id(2));
        assert_eq!(ancestors, BTreeSet::from([id(0), id(1)]));
        assert!(!ancestors.contains(&id(2)));
    }

    #[test]
    fn union_keeps_both_sides() {
        let mut a = CausalOrder::new();
        a.insert(id(0), vec![]);
        a.insert(id(1), vec![id(0)]);

        let mut b = CausalOrder::new();
        b.insert(id(0), vec![]);
        b.insert(id(2), vec![id(0)]);

        let merged = a.union(&b);
        assert_eq!(merged.len(), 3);
        assert!(merged.contains(&id(1)));
        assert!(merged.contains(&id(2)));
    }

    #[test]
    fn merge_ratio_counts_multi_parent_commits() {
        let mut causal = CausalOrder::new();
        assert_eq!(causal.merge_ratio(), 0.0);

        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);
        causal.insert(id(2), vec![id(0)]);
        causal.insert(id(3), vec![id(1), id(2)]);

        assert!((causal.merge_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn content_hash_tracks_contents() {
        let mut a = CausalOrder::new();
        a.insert(id(0), vec![]);
        let before = a.content_hash();

        let mut same = CausalOrder::new();
        same.insert(id(0), vec![]);
        assert_eq!(before, same.content_hash());

        a.insert(id(1), vec![id(0)]);
        assert_ne!(before, a.content_hash());
    }
}
