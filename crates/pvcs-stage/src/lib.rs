//! # pvcs-stage
//!
//! The staging engine of the pvcs substrate: the coordination layer
//! between an application issuing transactions, commits, forks and
//! merges, and the peer fabric gossiping repository metadata.
//!
//! A [`Stage`] reconciles locally applied transactions with incoming
//! publications from remote peers, materializes branch values by
//! replaying committed transactions, summarizes conflicts between
//! divergent branch heads, and drives the publish/fetch protocol that
//! converges state across peers.
//!
//! Observable state flows out of [`Stage::value_stream`]: one
//! [`BranchView`] per tracked branch — a plain value, a [`Conflict`]
//! when the branch diverged, or an abort report when incoming history
//! invalidated staged transactions.

mod cache;
mod conflict;
mod error;
mod evaluator;
mod materializer;
mod stage;
mod stage_loop;
mod state;
mod sync;
mod value;

pub use cache::CommitValueCache;
pub use conflict::summarize_conflict;
pub use error::{Result, StageError};
pub use evaluator::{Evaluator, MapEvaluator, SharedEvaluator, TransFn};
pub use materializer::{branch_value, commit_value, history_values, trans_apply_staged};
pub use stage::{merge_cost, Stage};
pub use state::{MetaChange, Op, RepoEntry, StageConfig, StageData, StageState};
pub use sync::sync;
pub use value::{BranchView, CommitRecord, Conflict, StageValue};
