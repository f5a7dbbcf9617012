//! Conflict summarization for diverged branches.

use crate::cache::CommitValueCache;
use crate::error::{Result, StageError};
use crate::evaluator::SharedEvaluator;
use crate::materializer::{commit_value, history_values};
use crate::value::Conflict;
use pvcs_meta::{isolate_branch, lowest_common_ancestors, RepoMeta};
use pvcs_store::SharedStore;
use std::collections::BTreeSet;

/// Summarize a diverged branch against its lowest common ancestor.
///
/// Computes the LCA cut of the two heads, takes the shared history up to
/// and including the cut as the offset into each side's linearization,
/// and packages the value at the cut together with the divergent commit
/// records of both sides. The application resolves from there; the stage
/// only reports.
///
/// The summary is a two-sided record, so the branch must have exactly
/// two live heads. Three or more mutually concurrent heads are rejected
/// with `WideConflict` rather than truncated to an arbitrary pair — the
/// caller merges a pair first and summarizes again.
pub async fn summarize_conflict(
    store: &SharedStore,
    eval: &SharedEvaluator,
    cache: &CommitValueCache,
    meta: &RepoMeta,
    branch: &str,
) -> Result<Conflict> {
    let heads = meta
        .heads(branch)
        .filter(|h| h.len() >= 2)
        .ok_or_else(|| StageError::MissingConflictForSummary {
            repo: meta.id.clone(),
            branch: branch.to_string(),
        })?;
    if heads.len() > 2 {
        return Err(StageError::WideConflict {
            repo: meta.id.clone(),
            branch: branch.to_string(),
            heads: heads.iter().copied().collect(),
        });
    }

    // Head sets iterate in id order, so every peer summarizes the same
    // pair the same way around.
    let mut iter = heads.iter();
    let head_a = *iter.next().expect("two heads checked above");
    let head_b = *iter.next().expect("two heads checked above");

    let lca = lowest_common_ancestors(
        &meta.causal,
        &BTreeSet::from([head_a]),
        &meta.causal,
        &BTreeSet::from([head_b]),
    );
    if lca.cut.len() != 1 {
        return Err(StageError::NonSingularLca(
            lca.cut.iter().copied().collect(),
        ));
    }

    let common = isolate_branch(&meta.causal, &lca.cut);
    let offset = common.len();

    let hist_a = history_values(store, &meta.causal, head_a).await?;
    let hist_b = history_values(store, &meta.causal, head_b).await?;

    let lca_commit = hist_a[offset - 1].id;
    let lca_value = commit_value(store, eval, cache, &meta.causal, lca_commit).await?;

    Ok(Conflict {
        lca_value,
        commits_a: hist_a[offset..].to_vec(),
        commits_b: hist_b[offset..].to_vec(),
    })
}
