//! Observable stage values.
//!
//! The stage exposes one value per `(user, repo, branch)` it tracks.
//! Normally that is the materialized branch value; a diverged branch
//! shows as a [`Conflict`], and incoming history that invalidated staged
//! transactions shows as an [`Abort`] wrapping the fresh value.

use pvcs_meta::{CommitId, RepoId, Transaction};
use serde_json::Value;
use std::collections::BTreeMap;

/// A loaded commit with its transactions materialized from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitRecord {
    /// The commit id.
    pub id: CommitId,

    /// Committing user.
    pub author: String,

    /// Branch the commit was made on.
    pub branch: String,

    /// The commit's transactions with parameters and function sources
    /// loaded.
    pub transactions: Vec<Transaction>,
}

/// Summary of a diverged branch: where the sides last agreed and what
/// each side did since.
#[derive(Clone, Debug, PartialEq)]
pub struct Conflict {
    /// The materialized value at the lowest common ancestor.
    pub lca_value: Value,

    /// Divergent commits on the first head's side, oldest first.
    pub commits_a: Vec<CommitRecord>,

    /// Divergent commits on the second head's side, oldest first.
    pub commits_b: Vec<CommitRecord>,
}

/// The observable state of one branch.
#[derive(Clone, Debug, PartialEq)]
pub enum BranchView {
    /// The materialized branch value.
    Value(Value),

    /// The branch has multiple heads.
    Conflict(Conflict),

    /// Incoming remote history invalidated locally staged transactions.
    /// `new_value` is the branch's fresh state (a value or a conflict,
    /// never a nested abort); `aborted` lists the dropped transactions
    /// in submission order.
    Abort {
        new_value: Box<BranchView>,
        aborted: Vec<Transaction>,
    },
}

impl BranchView {
    /// The plain value, if this view is one.
    pub fn value(&self) -> Option<&Value> {
        match self {
            BranchView::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The conflict, if this view is one.
    pub fn conflict(&self) -> Option<&Conflict> {
        match self {
            BranchView::Conflict(c) => Some(c),
            _ => None,
        }
    }

    /// The abort parts, if this view is one.
    pub fn abort(&self) -> Option<(&BranchView, &[Transaction])> {
        match self {
            BranchView::Abort { new_value, aborted } => Some((new_value, aborted)),
            _ => None,
        }
    }
}

/// Snapshot of everything the stage observes:
/// `user → repo → branch → view`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StageValue {
    entries: BTreeMap<String, BTreeMap<RepoId, BTreeMap<String, BranchView>>>,
}

impl StageValue {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one branch view.
    pub fn get(&self, user: &str, repo: &RepoId, branch: &str) -> Option<&BranchView> {
        self.entries.get(user)?.get(repo)?.get(branch)
    }

    /// Replace one branch view.
    pub fn set(&mut self, user: &str, repo: &RepoId, branch: &str, view: BranchView) {
        self.entries
            .entry(user.to_string())
            .or_default()
            .entry(repo.clone())
            .or_default()
            .insert(branch.to_string(), view);
    }

    /// Drop every view under a `(user, repo)` pair.
    pub fn remove_repo(&mut self, user: &str, repo: &RepoId) {
        let emptied = self
            .entries
            .get_mut(user)
            .map(|repos| {
                repos.remove(repo);
                repos.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            self.entries.remove(user);
        }
    }

    /// Iterate all `(user, repo, branch, view)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RepoId, &str, &BranchView)> {
        self.entries.iter().flat_map(|(user, repos)| {
            repos.iter().flat_map(move |(repo, branches)| {
                branches
                    .iter()
                    .map(move |(branch, view)| (user.as_str(), repo, branch.as_str(), view))
            })
        })
    }

    /// Check whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
