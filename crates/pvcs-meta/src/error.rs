//! Error types for the metadata algebra.

use crate::repo::RepoId;
use pvcs_store::Hash;
use thiserror::Error;

/// Errors that can occur in metadata operations.
#[derive(Error, Debug, Clone)]
pub enum MetaError {
    #[error("branch {branch:?} not found in repo {repo}")]
    BranchNotFound { repo: RepoId, branch: String },

    #[error("branch {branch:?} of repo {repo} has multiple heads: {heads:?}")]
    MultipleBranchHeads {
        repo: RepoId,
        branch: String,
        heads: Vec<Hash>,
    },

    #[error("heads order {given:?} does not cover the current heads {heads:?}")]
    HeadsOrderMismatch { given: Vec<Hash>, heads: Vec<Hash> },

    #[error("malformed commit object {id}: {reason}")]
    MalformedCommit { id: Hash, reason: String },

    #[error("commit {0} not present in causal order")]
    UnknownCommit(Hash),
}

/// Result type for metadata operations.
pub type Result<T> = std::result::Result<T, MetaError>;
