//! Depth-first linearization of the commit DAG.

use crate::causal::{CausalOrder, CommitId};
use std::collections::HashSet;

/// Linearize the commits reachable from `head`, oldest first, head last.
///
/// Every reachable commit appears exactly once, after all of its parents.
/// The traversal keeps an explicit stack, so arbitrarily deep histories
/// do not recurse.
///
/// For merge commits the parent vector's order (fixed by the commit
/// object's content) decides which side of the merge is emitted first,
/// which makes the linearization deterministic across peers.
pub fn history(causal: &CausalOrder, head: CommitId) -> Vec<CommitId> {
    let mut hist = Vec::new();
    let mut emitted: HashSet<CommitId> = HashSet::new();
    let mut stack = vec![head];

    while let Some(&top) = stack.last() {
        let pending: Vec<CommitId> = causal
            .parents(&top)
            .iter()
            .filter(|p| !emitted.contains(*p))
            .copied()
            .collect();

        if pending.is_empty() {
            stack.pop();
            if emitted.insert(top) {
                hist.push(top);
            }
        } else {
            // Push in reverse so the first parent is processed first.
            for parent in pending.into_iter().rev() {
                stack.push(parent);
            }
        }
    }

    hist
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvcs_store::Hash;

    fn id(n: u8) -> CommitId {
        Hash::digest(&[n])
    }

    #[test]
    fn linear_chain_is_oldest_first() {
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);
        causal.insert(id(2), vec![id(1)]);

        assert_eq!(history(&causal, id(2)), vec![id(0), id(1), id(2)]);
    }

    #[test]
    fn root_alone() {
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);

        assert_eq!(history(&causal, id(0)), vec![id(0)]);
    }

    #[test]
    fn diamond_emits_each_commit_once() {
        // 0 <- 1, 0 <- 2, {1,2} <- 3
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);
        causal.insert(id(2), vec![id(0)]);
        causal.insert(id(3), vec![id(1), id(2)]);

        let hist = history(&causal, id(3));
        assert_eq!(hist.len(), 4);
        assert_eq!(hist[0], id(0));
        assert_eq!(hist[3], id(3));

        // Parents always appear before their children.
        for (i, c) in hist.iter().enumerate() {
            for p in causal.parents(c) {
                assert!(hist[..i].contains(p));
            }
        }
    }

    #[test]
    fn merge_parent_order_decides_side_order() {
        let mut causal = CausalOrder::new();
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);
        causal.insert(id(2), vec![id(0)]);

        let mut forward = causal.clone();
        forward.insert(id(3), vec![id(1), id(2)]);
        assert_eq!(
            history(&forward, id(3)),
            vec![id(0), id(1), id(2), id(3)]
        );

        let mut reversed = causal.clone();
        reversed.insert(id(3), vec![id(2), id(1)]);
        assert_eq!(
            history(&reversed, id(3)),
            vec![id(0), id(2), id(1), id(3)]
        );
    }

    #[test]
    fn deep_history_does_not_overflow() {
        let mut causal = CausalOrder::new();
        let mut prev = id(0);
        causal.insert(prev, vec![]);
        let mut last = prev;
        for i in 0..50_000u32 {
            let next = Hash::digest(&i.to_le_bytes());
            causal.insert(next, vec![prev]);
            prev = next;
            last = next;
        }

        let hist = history(&causal, last);
        assert_eq!(hist.len(), 50_001);
        assert_eq!(hist[0], id(0));
        assert_eq!(*hist.last().unwrap(), last);
    }
}
