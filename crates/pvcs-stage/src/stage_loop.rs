//! The subscription side of the stage ↔ peer protocol.
//!
//! One task per stage consumes incoming publications serially: merge the
//! metadata, recompute the affected branch views, decide transaction
//! aborts, publish the new snapshot, acknowledge. Serial processing
//! means a publication burst is fully applied before the next one is
//! looked at.

use crate::materializer::branch_value;
use crate::stage::StageShared;
use crate::state::MetaChange;
use crate::value::{BranchView, StageValue};
use pvcs_wire::Message;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Run the stage loop until the peer channel closes.
pub(crate) async fn run(shared: Arc<StageShared>) {
    let mut rx = shared.link.subscribe();

    loop {
        let msg = match rx.recv().await {
            Ok(msg) => msg,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "stage loop lagged behind its inbox");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Message::MetaPub { metas, host, .. } = msg else {
            continue;
        };

        // Block detector: drop echoes of our own publications.
        if host.as_deref() == Some(shared.id.as_str()) {
            debug!("dropping echoed publication");
            continue;
        }

        handle_meta_pub(&shared, metas).await;

        if shared
            .link
            .send(Message::MetaPubed {
                peer: shared.id.clone(),
            })
            .await
            .is_err()
        {
            break;
        }
    }

    debug!(stage = %shared.id, "stage loop finished");
}

async fn handle_meta_pub(shared: &Arc<StageShared>, metas: pvcs_wire::MetaMap) {
    // The previous snapshot is read before the merge and without
    // locking against publication; readers may observe a monotonically
    // stale view between here and the final swap. Liveness over strict
    // coherence.
    let old_val = shared.current_value();

    let changes = shared.state.apply_meta_pub(&metas);
    if changes.is_empty() {
        return;
    }

    let mut new_val = old_val.clone();
    for change in &changes {
        recompute_repo(shared, &old_val, &mut new_val, change).await;
    }

    shared.publish_value(new_val);
}

/// Recompute every branch of one repo whose heads moved.
async fn recompute_repo(
    shared: &Arc<StageShared>,
    old_val: &StageValue,
    new_val: &mut StageValue,
    change: &MetaChange,
) {
    let MetaChange {
        user, repo, old, new,
    } = change;

    for branch in new.branches.keys() {
        let unchanged = old
            .as_ref()
            .map(|m| m.branches.get(branch) == new.branches.get(branch))
            .unwrap_or(false);
        if unchanged {
            continue;
        }

        let fresh = if new.multiple_branch_heads(branch) {
            crate::conflict::summarize_conflict(
                &shared.store,
                &shared.eval,
                &shared.cache,
                new,
                branch,
            )
            .await
            .map(BranchView::Conflict)
        } else {
            branch_value(&shared.store, &shared.eval, &shared.cache, new, branch, &[])
                .await
                .map(BranchView::Value)
        };

        let fresh = match fresh {
            Ok(view) => view,
            Err(e) => {
                warn!(%user, %repo, %branch, error = %e, "failed to recompute branch");
                continue;
            }
        };

        // The abort decision and the staged-transaction read happen
        // under the same lock `transact` appends under, so a transaction
        // is either folded into a published value or reported aborted —
        // never silently dropped.
        let aborted_now = {
            let _guard = shared.tx_lock.lock().await;
            shared.state.take_transactions(user, repo, branch)
        };

        let prev_aborted = match old_val.get(user, repo, branch) {
            Some(BranchView::Abort { aborted, .. }) => aborted.clone(),
            _ => Vec::new(),
        };

        let view = if aborted_now.is_empty() && prev_aborted.is_empty() {
            fresh
        } else {
            let mut aborted = prev_aborted;
            aborted.extend(aborted_now);
            BranchView::Abort {
                new_value: Box::new(fresh),
                aborted,
            }
        };

        new_val.set(user, repo, branch, view);
    }
}
