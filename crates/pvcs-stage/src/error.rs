//! Error types for the staging engine.

use pvcs_meta::{CommitId, MetaError, RepoId};
use pvcs_store::StoreError;
use pvcs_wire::WireError;
use thiserror::Error;

/// Errors surfaced by stage operations.
///
/// Store and wire failures propagate unchanged; the stage does not retry
/// them. A failing mutation leaves the stage state as it was before the
/// attempt. An aborted transaction is not an error at all — it is
/// reported through the value stream.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error("no conflict to summarize on branch {branch:?} of repo {repo}")]
    MissingConflictForSummary { repo: RepoId, branch: String },

    #[error(
        "branch {branch:?} of repo {repo} has {} live heads; a conflict summary covers exactly two",
        heads.len()
    )]
    WideConflict {
        repo: RepoId,
        branch: String,
        heads: Vec<CommitId>,
    },

    #[error("user {user} already holds repo {repo}")]
    ForkingImpossible { user: String, repo: RepoId },

    #[error("repo {repo} already exists for user {user}")]
    RepoAlreadyExists { user: String, repo: RepoId },

    #[error("lowest-common-ancestor cut is not a single commit: {0:?}")]
    NonSingularLca(Vec<CommitId>),

    #[error("repo {repo} not visible for user {user}")]
    UnknownRepo { user: String, repo: RepoId },

    #[error("cannot stage on {user}/{repo}:{branch:?} without a subscription")]
    NotSubscribed {
        user: String,
        repo: RepoId,
        branch: String,
    },

    #[error("unknown transaction function {0:?}")]
    UnknownTransFn(String),

    #[error("malformed transaction payload: {0}")]
    MalformedTransaction(String),
}

impl StageError {
    /// Check for the conflicted-branch condition regardless of which
    /// layer raised it.
    pub fn is_multiple_heads(&self) -> bool {
        matches!(
            self,
            StageError::Meta(MetaError::MultipleBranchHeads { .. })
        )
    }
}

/// Result type for stage operations.
pub type Result<T> = std::result::Result<T, StageError>;
