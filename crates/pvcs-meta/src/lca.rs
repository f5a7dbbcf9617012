//! Lowest-common-ancestor computation over commit DAGs.
//!
//! Conflict summarization needs the frontier where two divergent branch
//! histories last agreed. Both sides may know different subsets of the
//! DAG, so the exploration takes a causal order per side.

use crate::causal::{CausalOrder, CommitId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Result of a lowest-common-ancestor query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LcaResult {
    /// The common-ancestor frontier: common commits with no child in the
    /// common set. Ideally a singleton.
    pub cut: BTreeSet<CommitId>,

    /// Reverse edges over side a's explored region: ancestor → children
    /// through which it was reached from `heads_a`.
    pub returnpaths_a: BTreeMap<CommitId, BTreeSet<CommitId>>,

    /// Reverse edges over side b's explored region.
    pub returnpaths_b: BTreeMap<CommitId, BTreeSet<CommitId>>,
}

/// Walk ancestors of `heads`, collecting the visited set and reverse
/// edges along the way.
fn explore(
    causal: &CausalOrder,
    heads: &BTreeSet<CommitId>,
) -> (BTreeSet<CommitId>, BTreeMap<CommitId, BTreeSet<CommitId>>) {
    let mut visited = BTreeSet::new();
    let mut returnpaths: BTreeMap<CommitId, BTreeSet<CommitId>> = BTreeMap::new();
    let mut queue: VecDeque<CommitId> = heads.iter().copied().collect();

    while let Some(commit) = queue.pop_front() {
        if !visited.insert(commit) {
            continue;
        }
        for parent in causal.parents(&commit) {
            returnpaths.entry(*parent).or_default().insert(commit);
            if !visited.contains(parent) {
                queue.push_back(*parent);
            }
        }
    }

    (visited, returnpaths)
}

/// Compute the lowest-common-ancestor cut between two head sets.
pub fn lowest_common_ancestors(
    causal_a: &CausalOrder,
    heads_a: &BTreeSet<CommitId>,
    causal_b: &CausalOrder,
    heads_b: &BTreeSet<CommitId>,
) -> LcaResult {
    let (reach_a, returnpaths_a) = explore(causal_a, heads_a);
    let (reach_b, returnpaths_b) = explore(causal_b, heads_b);

    let common: BTreeSet<CommitId> = reach_a.intersection(&reach_b).copied().collect();

    // A common commit is below the cut iff some common commit lists it as
    // a parent.
    let mut covered = BTreeSet::new();
    for commit in &common {
        for parent in causal_a
            .parents(commit)
            .iter()
            .chain(causal_b.parents(commit))
        {
            if common.contains(parent) {
                covered.insert(*parent);
            }
        }
    }

    let cut = common.difference(&covered).copied().collect();

    LcaResult {
        cut,
        returnpaths_a,
        returnpaths_b,
    }
}

/// Extract the sub-causal-order of everything at or below `cut`.
///
/// The keys of the result are the common history shared by both sides of
/// a conflict, which gives the offset into each side's linearization.
pub fn isolate_branch(causal: &CausalOrder, cut: &BTreeSet<CommitId>) -> CausalOrder {
    let mut isolated = CausalOrder::new();
    let mut queue: VecDeque<CommitId> = cut.iter().copied().collect();

    while let Some(commit) = queue.pop_front() {
        if isolated.contains(&commit) {
            continue;
        }
        let parents = causal.parents(&commit).to_vec();
        queue.extend(parents.iter().copied());
        isolated.insert(commit, parents);
    }

    isolated
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvcs_store::Hash;

    fn id(n: u8) -> CommitId {
        Hash::digest(&[n])
    }

    fn heads(ids: &[CommitId]) -> BTreeSet<CommitId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn diverged_heads_meet_at_fork_point() {
        // 0 <- 1 <- 2 (side a), 0 <- 1 <- 3 (side b)
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);
        causal.insert(id(2), vec![id(1)]);
        causal.insert(id(3), vec![id(1)]);

        let result =
            lowest_common_ancestors(&causal, &heads(&[id(2)]), &causal, &heads(&[id(3)]));

        assert_eq!(result.cut, heads(&[id(1)]));
        // 1 was reached from 2 on side a and from 3 on side b.
        assert_eq!(result.returnpaths_a[&id(1)], heads(&[id(2)]));
        assert_eq!(result.returnpaths_b[&id(1)], heads(&[id(3)]));
    }

    #[test]
    fn same_head_is_its_own_cut() {
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);

        let result =
            lowest_common_ancestors(&causal, &heads(&[id(1)]), &causal, &heads(&[id(1)]));

        assert_eq!(result.cut, heads(&[id(1)]));
    }

    #[test]
    fn partial_views_still_find_the_cut() {
        // Side a only knows its own chain, side b only knows its own.
        let mut causal_a = CausalOrder::new();
        causal_a.insert(id(0), vec![]);
        causal_a.insert(id(1), vec![id(0)]);

        let mut causal_b = CausalOrder::new();
        causal_b.insert(id(0), vec![]);
        causal_b.insert(id(2), vec![id(0)]);

        let result =
            lowest_common_ancestors(&causal_a, &heads(&[id(1)]), &causal_b, &heads(&[id(2)]));

        assert_eq!(result.cut, heads(&[id(0)]));
    }

    #[test]
    fn criss_cross_yields_non_singular_cut() {
        // Two merge commits that each span both earlier branches.
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);
        causal.insert(id(2), vec![id(0)]);
        causal.insert(id(3), vec![id(1), id(2)]);
        causal.insert(id(4), vec![id(1), id(2)]);

        let result =
            lowest_common_ancestors(&causal, &heads(&[id(3)]), &causal, &heads(&[id(4)]));

        assert_eq!(result.cut, heads(&[id(1), id(2)]));
    }

    #[test]
    fn isolate_branch_collects_cut_and_ancestors() {
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);
        causal.insert(id(2), vec![id(1)]);
        causal.insert(id(3), vec![id(2)]);

        let isolated = isolate_branch(&causal, &heads(&[id(1)]));

        assert_eq!(isolated.len(), 2);
        assert!(isolated.contains(&id(0)));
        assert!(isolated.contains(&id(1)));
        assert!(!isolated.contains(&id(2)));
    }
}
