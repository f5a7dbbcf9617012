//! Repository metadata, commit objects, and staged transactions.

use crate::causal::{CausalOrder, CommitId};
use crate::error::{MetaError, Result};
use pvcs_store::{Blob, Hash, BLOB_TRANS_FN};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use ulid::Ulid;

/// Identifier of a repository.
///
/// Random at creation; forks keep the id, which is what lets two users'
/// editions of the same repository find each other.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepoId(String);

impl RepoId {
    /// Mint a fresh random id.
    pub fn random() -> Self {
        RepoId(Ulid::new().to_string())
    }

    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        RepoId(id.into())
    }

    /// View as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A staged, uncommitted transaction: parameters plus the source form of
/// the transaction function that will consume them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction parameters: a JSON value, or raw bytes for the
    /// blob-store path.
    pub params: Blob,

    /// Source form of the transaction function, resolved by the
    /// application's evaluator at materialization time.
    pub trans_fn: String,
}

impl Transaction {
    /// Stage a JSON transaction.
    pub fn new(params: Value, trans_fn: impl Into<String>) -> Self {
        Transaction {
            params: Blob::json(params),
            trans_fn: trans_fn.into(),
        }
    }

    /// Stage a binary payload routed through the blob-store function.
    pub fn binary(data: Vec<u8>) -> Self {
        Transaction {
            params: Blob::binary(data),
            trans_fn: BLOB_TRANS_FN.to_string(),
        }
    }

    /// Check whether this transaction takes the blob-store path.
    pub fn is_blob(&self) -> bool {
        self.trans_fn == BLOB_TRANS_FN
    }
}

/// An immutable commit object, stored as a JSON blob whose content hash
/// is the commit id.
///
/// Transactions are referenced by content address: `(param-id, fn-id)`
/// pairs pointing at the stored parameter and function-source blobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitObject {
    /// Parent commit ids. Order is part of the content and controls how
    /// merge sides contribute during materialization.
    pub parents: Vec<CommitId>,

    /// `(param-id, trans-fn-id)` content-address pairs.
    pub transactions: Vec<(Hash, Hash)>,

    /// Committing user.
    pub author: String,

    /// Branch the commit was made on.
    pub branch: String,
}

impl CommitObject {
    /// Serialize to the stored blob form.
    pub fn to_blob(&self) -> Blob {
        let value = serde_json::to_value(self).expect("commit object serializes");
        Blob::json(value)
    }

    /// The commit id: content address of the blob form.
    pub fn id(&self) -> CommitId {
        self.to_blob().content_hash()
    }

    /// Deserialize from a stored blob.
    pub fn from_blob(id: Hash, blob: &Blob) -> Result<Self> {
        let value = blob.as_json().ok_or_else(|| MetaError::MalformedCommit {
            id,
            reason: "commit blob is binary".to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| MetaError::MalformedCommit {
            id,
            reason: e.to_string(),
        })
    }

    /// Check if this is a merge commit.
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

/// Repository metadata: the commit DAG plus named branch heads.
///
/// This is what peers gossip in `meta-pub` messages; content blobs are
/// fetched separately.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMeta {
    /// Repository identity, shared across forks.
    pub id: RepoId,

    /// Human-readable description.
    pub description: String,

    /// Whether the repository may be gossiped to arbitrary peers.
    pub public: bool,

    /// The commit DAG.
    pub causal: CausalOrder,

    /// Branch name → head set. More than one head means the branch is in
    /// conflict.
    pub branches: BTreeMap<String, BTreeSet<CommitId>>,
}

impl RepoMeta {
    /// Heads of a branch, if the branch exists.
    pub fn heads(&self, branch: &str) -> Option<&BTreeSet<CommitId>> {
        self.branches.get(branch)
    }

    /// The unique head of a branch.
    ///
    /// Errors with `MultipleBranchHeads` when the branch is in conflict.
    pub fn single_head(&self, branch: &str) -> Result<CommitId> {
        let heads = self.heads(branch).ok_or_else(|| MetaError::BranchNotFound {
            repo: self.id.clone(),
            branch: branch.to_string(),
        })?;
        if heads.len() == 1 {
            Ok(*heads.iter().next().expect("non-empty head set"))
        } else {
            Err(MetaError::MultipleBranchHeads {
                repo: self.id.clone(),
                branch: branch.to_string(),
                heads: heads.iter().copied().collect(),
            })
        }
    }

    /// Check whether a branch has diverged.
    pub fn multiple_branch_heads(&self, branch: &str) -> bool {
        self.heads(branch).map(|h| h.len() > 1).unwrap_or(false)
    }

    /// CRDT-style union with another edition of the same repository.
    ///
    /// Causal orders union (content addressing makes shared entries
    /// identical); branch head sets union and then drop any head that is
    /// an ancestor of a sibling head. Commutative and idempotent, so
    /// publication order between peers does not matter.
    pub fn update(&self, other: &RepoMeta) -> RepoMeta {
        let causal = self.causal.union(&other.causal);

        let mut branches = self.branches.clone();
        for (branch, heads) in &other.branches {
            branches
                .entry(branch.clone())
                .or_default()
                .extend(heads.iter().copied());
        }

        for heads in branches.values_mut() {
            let candidates: Vec<CommitId> = heads.iter().copied().collect();
            for head in &candidates {
                let superseded = candidates
                    .iter()
                    .filter(|h| *h != head)
                    .any(|h| causal.ancestors(h).contains(head));
                if superseded {
                    heads.remove(head);
                }
            }
        }

        RepoMeta {
            id: self.id.clone(),
            description: self.description.clone(),
            public: self.public || other.public,
            causal,
            branches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(n: u8) -> CommitId {
        Hash::digest(&[n])
    }

    fn meta_with(branch: &str, causal: CausalOrder, heads: &[CommitId]) -> RepoMeta {
        RepoMeta {
            id: RepoId::new("repo-1"),
            description: "test".to_string(),
            public: false,
            causal,
            branches: BTreeMap::from([(
                branch.to_string(),
                heads.iter().copied().collect(),
            )]),
        }
    }

    #[test]
    fn commit_object_roundtrip() {
        let commit = CommitObject {
            parents: vec![id(0)],
            transactions: vec![(id(1), id(2))],
            author: "john".to_string(),
            branch: "master".to_string(),
        };

        let blob = commit.to_blob();
        let restored = CommitObject::from_blob(commit.id(), &blob).unwrap();

        assert_eq!(commit, restored);
        assert_eq!(commit.id(), blob.content_hash());
    }

    #[test]
    fn commit_id_depends_on_parent_order() {
        let forward = CommitObject {
            parents: vec![id(1), id(2)],
            transactions: vec![],
            author: "a".to_string(),
            branch: "b".to_string(),
        };
        let reversed = CommitObject {
            parents: vec![id(2), id(1)],
            ..forward.clone()
        };

        assert_ne!(forward.id(), reversed.id());
        assert!(forward.is_merge());
    }

    #[test]
    fn single_head_detects_conflict() {
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);
        causal.insert(id(2), vec![id(0)]);

        let clean = meta_with("master", causal.clone(), &[id(1)]);
        assert_eq!(clean.single_head("master").unwrap(), id(1));
        assert!(!clean.multiple_branch_heads("master"));

        let conflicted = meta_with("master", causal, &[id(1), id(2)]);
        assert!(conflicted.multiple_branch_heads("master"));
        assert!(matches!(
            conflicted.single_head("master"),
            Err(MetaError::MultipleBranchHeads { .. })
        ));

        assert!(matches!(
            clean.single_head("missing"),
            Err(MetaError::BranchNotFound { .. })
        ));
    }

    #[test]
    fn update_unions_divergent_heads() {
        let mut causal_a = CausalOrder::new();
        causal_a.insert(id(0), vec![]);
        causal_a.insert(id(1), vec![id(0)]);

        let mut causal_b = CausalOrder::new();
        causal_b.insert(id(0), vec![]);
        causal_b.insert(id(2), vec![id(0)]);

        let a = meta_with("master", causal_a, &[id(1)]);
        let b = meta_with("master", causal_b, &[id(2)]);

        let merged = a.update(&b);
        assert_eq!(
            merged.branches["master"],
            BTreeSet::from([id(1), id(2)])
        );
        assert_eq!(merged.causal.len(), 3);
    }

    #[test]
    fn update_prunes_superseded_heads() {
        // Remote extends our head: 0 <- 1 <- 2; our head 1 is an
        // ancestor of the remote head 2 and must be retired.
        let mut local_causal = CausalOrder::new();
        local_causal.insert(id(0), vec![]);
        local_causal.insert(id(1), vec![id(0)]);

        let mut remote_causal = local_causal.clone();
        remote_causal.insert(id(2), vec![id(1)]);

        let local = meta_with("master", local_causal, &[id(1)]);
        let remote = meta_with("master", remote_causal, &[id(2)]);

        let merged = local.update(&remote);
        assert_eq!(merged.branches["master"], BTreeSet::from([id(2)]));
    }

    #[test]
    fn update_is_idempotent_and_commutative() {
        let mut causal_a = CausalOrder::new();
        causal_a.insert(id(0), vec![]);
        causal_a.insert(id(1), vec![id(0)]);

        let mut causal_b = CausalOrder::new();
        causal_b.insert(id(0), vec![]);
        causal_b.insert(id(2), vec![id(0)]);

        let a = meta_with("master", causal_a, &[id(1)]);
        let b = meta_with("master", causal_b, &[id(2)]);

        let ab = a.update(&b);
        let ba = b.update(&a);
        assert_eq!(ab.branches, ba.branches);
        assert_eq!(ab.causal, ba.causal);

        assert_eq!(ab.update(&b).branches, ab.branches);
        assert_eq!(ab.update(&ab), ab);
    }

    #[test]
    fn transaction_kinds() {
        let json_tx = Transaction::new(json!({"b": 2}), "merge");
        assert!(!json_tx.is_blob());

        let blob_tx = Transaction::binary(vec![1, 2, 3]);
        assert!(blob_tx.is_blob());
        assert_eq!(blob_tx.trans_fn, BLOB_TRANS_FN);
    }
}
