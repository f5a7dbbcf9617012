//! # pvcs-meta
//!
//! Repository metadata algebra for the pvcs substrate.
//!
//! This crate provides:
//! - The commit DAG as a parent map ([`CausalOrder`]) with depth-first
//!   linearization ([`history`])
//! - Content-addressed commit objects and repository metadata
//!   ([`CommitObject`], [`RepoMeta`])
//! - Pure repository operations: [`new_repository`], [`fork`],
//!   [`commit`], [`merge`], and the CRDT-style [`RepoMeta::update`]
//! - Lowest-common-ancestor queries for conflict summarization
//!   ([`lowest_common_ancestors`], [`isolate_branch`])
//!
//! Everything here is a pure value computation; storage, publication and
//! concurrency live in the store, wire and stage crates.

mod causal;
mod error;
mod history;
mod lca;
mod ops;
mod repo;

pub use causal::{CausalOrder, CommitId};
pub use error::{MetaError, Result};
pub use history::history;
pub use lca::{isolate_branch, lowest_common_ancestors, LcaResult};
pub use ops::{commit, fork, merge, new_repository, CommitOutcome, NewBlob};
pub use repo::{CommitObject, RepoId, RepoMeta, Transaction};
