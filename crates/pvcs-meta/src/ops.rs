//! Repository operations: create, fork, commit, merge.
//!
//! All operations are pure: they take metadata values and return fresh
//! metadata plus the blobs they minted, leaving installation, publication
//! and blob serving to the caller. That keeps the commit primitive usable
//! under whatever atomicity regime the staging layer imposes.

use crate::causal::CommitId;
use crate::error::{MetaError, Result};
use crate::lca::isolate_branch;
use crate::repo::{CommitObject, RepoId, RepoMeta, Transaction};
use pvcs_store::{blob_trans_id, Blob, Hash};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A freshly minted blob and its content address.
pub type NewBlob = (Hash, Blob);

/// Result of a commit-producing operation.
#[derive(Clone, Debug)]
pub struct CommitOutcome {
    /// The updated metadata.
    pub meta: RepoMeta,

    /// The new head commit.
    pub head: CommitId,

    /// Blobs minted by the operation, to be installed locally and served
    /// to fetching peers.
    pub new_blobs: Vec<NewBlob>,
}

/// Mint the blobs for one staged transaction.
///
/// Binary transactions reference the well-known blob-store marker as
/// their function id; no function blob is minted for it because the
/// materializer recognizes the marker without loading anything.
fn mint_transaction(tx: &Transaction, blobs: &mut Vec<NewBlob>) -> (Hash, Hash) {
    let param_id = tx.params.content_hash();
    blobs.push((param_id, tx.params.clone()));

    let fn_id = if tx.is_blob() {
        blob_trans_id()
    } else {
        let fn_blob = Blob::json(Value::String(tx.trans_fn.clone()));
        let fn_id = fn_blob.content_hash();
        blobs.push((fn_id, fn_blob));
        fn_id
    };

    (param_id, fn_id)
}

/// Build a commit object, mint its blob, and thread it into the metadata.
fn append_commit(
    mut meta: RepoMeta,
    commit: CommitObject,
    mut new_blobs: Vec<NewBlob>,
) -> CommitOutcome {
    let branch = commit.branch.clone();
    let parents = commit.parents.clone();
    let blob = commit.to_blob();
    let head = blob.content_hash();
    new_blobs.push((head, blob));

    meta.causal.insert(head, parents);
    meta.branches.insert(branch, BTreeSet::from([head]));

    CommitOutcome {
        meta,
        head,
        new_blobs,
    }
}

/// Create a new repository with a random id.
///
/// The root commit carries a single `(init_val, "init")` transaction, so
/// the branch materializes to the initial value under any evaluator that
/// resolves `"init"`.
pub fn new_repository(
    author: &str,
    description: &str,
    public: bool,
    init_val: Value,
    branch: &str,
) -> (RepoMeta, CommitId, Vec<NewBlob>) {
    let mut blobs = Vec::new();
    let tx = Transaction::new(init_val, "init");
    let tx_ref = mint_transaction(&tx, &mut blobs);

    let root = CommitObject {
        parents: vec![],
        transactions: vec![tx_ref],
        author: author.to_string(),
        branch: branch.to_string(),
    };

    let meta = RepoMeta {
        id: RepoId::random(),
        description: description.to_string(),
        public,
        causal: Default::default(),
        branches: BTreeMap::new(),
    };

    let outcome = append_commit(meta, root, blobs);
    (outcome.meta, outcome.head, outcome.new_blobs)
}

/// Fork one branch of a repository, keeping its id.
///
/// The fork carries the branch's heads and their ancestry; other branches
/// and unrelated history are left behind.
pub fn fork(meta: &RepoMeta, branch: &str) -> Result<RepoMeta> {
    let heads = meta
        .heads(branch)
        .ok_or_else(|| MetaError::BranchNotFound {
            repo: meta.id.clone(),
            branch: branch.to_string(),
        })?
        .clone();

    let causal = isolate_branch(&meta.causal, &heads);

    Ok(RepoMeta {
        id: meta.id.clone(),
        description: meta.description.clone(),
        public: meta.public,
        causal,
        branches: BTreeMap::from([(branch.to_string(), heads)]),
    })
}

/// Commit staged transactions on a branch.
///
/// The branch must have a unique head; a conflicted branch must be
/// merged before it can take new commits.
pub fn commit(
    meta: &RepoMeta,
    author: &str,
    branch: &str,
    staged: &[Transaction],
) -> Result<CommitOutcome> {
    let head = meta.single_head(branch)?;

    let mut blobs = Vec::new();
    let tx_refs = staged
        .iter()
        .map(|tx| mint_transaction(tx, &mut blobs))
        .collect();

    let commit = CommitObject {
        parents: vec![head],
        transactions: tx_refs,
        author: author.to_string(),
        branch: branch.to_string(),
    };

    Ok(append_commit(meta.clone(), commit, blobs))
}

/// Merge the divergent heads of a branch into a single commit.
///
/// `remote` is first unioned into `meta`; `heads_order` must then cover
/// the branch's heads exactly and becomes the merge commit's parent
/// order, deciding how the sides contribute during materialization. The
/// common past is untouched — only the divergent heads are ordered.
pub fn merge(
    meta: &RepoMeta,
    author: &str,
    branch: &str,
    remote: &RepoMeta,
    heads_order: &[CommitId],
) -> Result<CommitOutcome> {
    let merged = meta.update(remote);
    let heads = merged
        .heads(branch)
        .ok_or_else(|| MetaError::BranchNotFound {
            repo: merged.id.clone(),
            branch: branch.to_string(),
        })?;

    let given: BTreeSet<CommitId> = heads_order.iter().copied().collect();
    if given.len() != heads_order.len() || given != *heads {
        return Err(MetaError::HeadsOrderMismatch {
            given: heads_order.to_vec(),
            heads: heads.iter().copied().collect(),
        });
    }

    let commit = CommitObject {
        parents: heads_order.to_vec(),
        transactions: vec![],
        author: author.to_string(),
        branch: branch.to_string(),
    };

    Ok(append_commit(merged, commit, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_repository_seeds_init_transaction() {
        let (meta, head, blobs) =
            new_repository("john", "test repo", false, json!({"init": 43}), "master");

        assert_eq!(meta.branches["master"], BTreeSet::from([head]));
        assert_eq!(meta.causal.len(), 1);
        assert!(meta.causal.parents(&head).is_empty());

        // init params, "init" source, and the commit object itself.
        assert_eq!(blobs.len(), 3);
        let (commit_id, commit_blob) = blobs.last().unwrap();
        assert_eq!(*commit_id, head);

        let commit = CommitObject::from_blob(*commit_id, commit_blob).unwrap();
        assert_eq!(commit.transactions.len(), 1);
        assert_eq!(commit.author, "john");
    }

    #[test]
    fn commit_extends_the_branch() {
        let (meta, root, _) =
            new_repository("john", "test", false, json!({"init": 43}), "master");

        let staged = vec![Transaction::new(json!({"b": 2}), "merge")];
        let outcome = commit(&meta, "john", "master", &staged).unwrap();

        assert_ne!(outcome.head, root);
        assert_eq!(outcome.meta.causal.parents(&outcome.head), &[root]);
        assert_eq!(
            outcome.meta.branches["master"],
            BTreeSet::from([outcome.head])
        );
        // param + fn source + commit object.
        assert_eq!(outcome.new_blobs.len(), 3);
    }

    #[test]
    fn binary_commit_references_the_marker() {
        let (meta, _, _) = new_repository("john", "test", false, json!({}), "master");

        let staged = vec![Transaction::binary(vec![1, 2, 3])];
        let outcome = commit(&meta, "john", "master", &staged).unwrap();

        let (_, commit_blob) = outcome.new_blobs.last().unwrap();
        let commit = CommitObject::from_blob(outcome.head, commit_blob).unwrap();
        assert_eq!(commit.transactions[0].1, blob_trans_id());
        // param + commit object only; the marker mints no fn blob.
        assert_eq!(outcome.new_blobs.len(), 2);
    }

    #[test]
    fn commit_refuses_conflicted_branch() {
        let (meta, root, _) = new_repository("a", "test", false, json!({}), "master");

        let side_a = commit(&meta, "a", "master", &[]).unwrap();
        let side_b = commit(&meta, "b", "master", &[]).unwrap();
        let conflicted = side_a.meta.update(&side_b.meta);
        assert!(conflicted.multiple_branch_heads("master"));
        let _ = root;

        assert!(matches!(
            commit(&conflicted, "a", "master", &[]),
            Err(MetaError::MultipleBranchHeads { .. })
        ));
    }

    #[test]
    fn fork_keeps_id_and_branch_history() {
        let (meta, head, _) =
            new_repository("john", "test", false, json!({"init": 43}), "master");

        let forked = fork(&meta, "master").unwrap();
        assert_eq!(forked.id, meta.id);
        assert_eq!(forked.branches["master"], BTreeSet::from([head]));
        assert_eq!(forked.causal.len(), meta.causal.len());

        assert!(matches!(
            fork(&meta, "missing"),
            Err(MetaError::BranchNotFound { .. })
        ));
    }

    #[test]
    fn merge_resolves_a_conflict() {
        let (meta, _, _) = new_repository("a", "test", false, json!({}), "master");

        let side_a = commit(&meta, "a", "master", &[]).unwrap();
        let side_b = commit(&meta, "b", "master", &[]).unwrap();

        let order = vec![side_a.head, side_b.head];
        let outcome = merge(&side_a.meta, "a", "master", &side_b.meta, &order).unwrap();

        assert_eq!(
            outcome.meta.branches["master"],
            BTreeSet::from([outcome.head])
        );
        assert_eq!(outcome.meta.causal.parents(&outcome.head), order.as_slice());
    }

    #[test]
    fn merge_rejects_bad_heads_order() {
        let (meta, _, _) = new_repository("a", "test", false, json!({}), "master");

        let side_a = commit(&meta, "a", "master", &[]).unwrap();
        let side_b = commit(&meta, "b", "master", &[]).unwrap();

        // Missing one head.
        assert!(matches!(
            merge(&side_a.meta, "a", "master", &side_b.meta, &[side_a.head]),
            Err(MetaError::HeadsOrderMismatch { .. })
        ));

        // Duplicated head.
        assert!(matches!(
            merge(
                &side_a.meta,
                "a",
                "master",
                &side_b.meta,
                &[side_a.head, side_a.head]
            ),
            Err(MetaError::HeadsOrderMismatch { .. })
        ));
    }
}
