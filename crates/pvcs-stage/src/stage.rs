//! The stage handle and its public operations.

use crate::cache::CommitValueCache;
use crate::conflict;
use crate::error::{Result, StageError};
use crate::evaluator::SharedEvaluator;
use crate::materializer::branch_value;
use crate::stage_loop;
use crate::state::{Op, RepoEntry, StageConfig, StageData, StageState};
use crate::sync::sync;
use crate::value::{BranchView, Conflict, StageValue};
use pvcs_meta::{CausalOrder, CommitId, RepoId, Transaction};
use pvcs_store::{Blob, BlobStore};
use pvcs_wire::{next_matching, Message, PeerLink, SubSpec};
use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use ulid::Ulid;

/// Shared internals of a stage, visible to the loop task.
pub(crate) struct StageShared {
    pub(crate) id: String,
    pub(crate) user: String,
    pub(crate) link: PeerLink,
    pub(crate) store: pvcs_store::SharedStore,
    pub(crate) eval: SharedEvaluator,
    pub(crate) cache: CommitValueCache,
    pub(crate) state: StageState,
    pub(crate) tx_lock: tokio::sync::Mutex<()>,
    pub(crate) val_tx: watch::Sender<StageValue>,
}

impl StageShared {
    pub(crate) fn current_value(&self) -> StageValue {
        self.val_tx.borrow().clone()
    }

    /// Swap the observable snapshot, skipping no-op updates so watchers
    /// are only woken for real changes.
    pub(crate) fn publish_value(&self, new: StageValue) {
        self.val_tx.send_if_modified(|cur| {
            if *cur == new {
                false
            } else {
                *cur = new;
                true
            }
        });
    }
}

/// Randomized-backoff bound for a merge attempt, in milliseconds.
///
/// Grows with the share of merge commits in the history: zero for a
/// merge-free DAG, unbounded as everything becomes merges. Spreading
/// concurrent mergers out over this window keeps them from thrashing
/// each other's heads.
pub fn merge_cost(causal: &CausalOrder) -> u64 {
    let ratio = causal.merge_ratio();
    (100_000.0 * -(1.0 - ratio).ln()).floor() as u64
}

/// A user session against the substrate.
///
/// The stage tracks repositories per user, stages transactions, commits
/// and merges them, and converges with remote peers through its peer
/// link. Observable state arrives on the value stream; only the latest
/// snapshot is retained for slow consumers.
pub struct Stage {
    shared: Arc<StageShared>,
    loop_task: JoinHandle<()>,
}

impl Stage {
    /// Create a stage for a user, wiring it into a peer.
    ///
    /// `connect` receives the freshly minted stage id and returns the
    /// peer link for it — handing the peer the same id the stage will
    /// use as its host tag is what lets the fabric suppress echoes at
    /// the source. Registers the blob-transaction function source in
    /// the store and starts the stage loop.
    pub async fn create<F>(
        user: impl Into<String>,
        store: pvcs_store::SharedStore,
        eval: SharedEvaluator,
        connect: F,
    ) -> Result<Stage>
    where
        F: FnOnce(&str) -> PeerLink,
    {
        let user = user.into();
        let id = format!("stage-{}", Ulid::new());
        let link = connect(&id);

        store
            .put(Blob::json(Value::String(
                pvcs_store::BLOB_TRANS_FN.to_string(),
            )))
            .await?;

        let (val_tx, _) = watch::channel(StageValue::new());
        let shared = Arc::new(StageShared {
            id: id.clone(),
            user: user.clone(),
            link,
            store,
            eval,
            cache: CommitValueCache::new(),
            state: StageState::new(StageConfig {
                id,
                user,
                subs: SubSpec::new(),
            }),
            tx_lock: tokio::sync::Mutex::new(()),
            val_tx,
        });

        let loop_task = tokio::spawn(stage_loop::run(shared.clone()));

        Ok(Stage { shared, loop_task })
    }

    /// The stage's identity (its host tag on publications).
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// The local user.
    pub fn user(&self) -> &str {
        &self.shared.user
    }

    /// Subscribe to observable snapshots. The channel keeps only the
    /// latest value; slow consumers miss intermediates but never see a
    /// stale final state.
    pub fn value_stream(&self) -> watch::Receiver<StageValue> {
        self.shared.val_tx.subscribe()
    }

    /// The latest observable snapshot.
    pub fn current_value(&self) -> StageValue {
        self.shared.current_value()
    }

    /// A consistent copy of the internal state, for inspection.
    pub fn state_snapshot(&self) -> StageData {
        self.shared.state.snapshot()
    }

    /// Summarize the conflict on a diverged branch.
    pub async fn summarize_conflict(
        &self,
        user: &str,
        repo: &RepoId,
        branch: &str,
    ) -> Result<Conflict> {
        let meta = self.require_meta(user, repo)?;
        conflict::summarize_conflict(
            &self.shared.store,
            &self.shared.eval,
            &self.shared.cache,
            &meta,
            branch,
        )
        .await
    }

    /// Ask the peer fabric to reach a remote peer, waiting for the
    /// acknowledgement that names the same url.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let mut rx = self.shared.link.subscribe();
        self.shared
            .link
            .send(Message::Connect {
                url: url.to_string(),
            })
            .await?;
        next_matching(&mut rx, |m| {
            matches!(m, Message::Connected { url: u } if u == url)
        })
        .await?;
        Ok(())
    }

    /// Create a repository owned by the local user and publish it.
    pub async fn create_repo(
        &self,
        description: &str,
        init_val: Value,
        branch: &str,
    ) -> Result<RepoId> {
        let user = self.shared.user.clone();
        let (meta, _, blobs) =
            pvcs_meta::new_repository(&user, description, false, init_val, branch);
        let repo = meta.id.clone();

        self.store_blobs(&blobs).await?;
        self.shared
            .state
            .install_repo(&user, &repo, RepoEntry::created(meta, branch, blobs))?;
        self.shared.state.add_sub(&user, &repo, branch);

        self.refresh_branch(&user, &repo, branch).await?;

        let metas = publish_spec(&user, &repo, branch);
        sync(&self.shared.state, &self.shared.link, &self.shared.id, &metas).await?;
        self.shared.state.cleanup_ops_and_new_values(&metas);

        self.subscribe_repos(self.shared.state.config().subs).await?;

        Ok(repo)
    }

    /// Fork a stage-visible repository into the local user's namespace,
    /// keeping its id.
    pub async fn fork(&self, from_user: &str, repo: &RepoId, branch: &str) -> Result<()> {
        let user = self.shared.user.clone();
        if self.shared.state.contains(&user, repo) {
            return Err(StageError::ForkingImpossible {
                user,
                repo: repo.clone(),
            });
        }

        let source = self.shared.state.meta(from_user, repo).ok_or_else(|| {
            StageError::UnknownRepo {
                user: from_user.to_string(),
                repo: repo.clone(),
            }
        })?;
        let forked = pvcs_meta::fork(&source, branch)?;

        let mut entry = RepoEntry::new(forked);
        entry.op = Op::MetaPub;
        self.shared
            .state
            .install_repo(&user, repo, entry)
            .map_err(|_| StageError::ForkingImpossible {
                user: self.shared.user.clone(),
                repo: repo.clone(),
            })?;
        self.shared.state.add_sub(&user, repo, branch);

        self.refresh_branch(&user, repo, branch).await?;

        let metas = publish_spec(&user, repo, branch);
        sync(&self.shared.state, &self.shared.link, &self.shared.id, &metas).await?;
        self.shared.state.cleanup_ops_and_new_values(&metas);

        self.subscribe_repos(self.shared.state.config().subs).await?;

        Ok(())
    }

    /// Replace the subscription set.
    ///
    /// Announces the new filter, requests a publication of everything it
    /// covers, and blocks until every subscribed repo is visible in the
    /// stage.
    pub async fn subscribe_repos(&self, subs: SubSpec) -> Result<()> {
        let mut rx = self.shared.link.subscribe();
        self.shared.state.set_subs(subs.clone());

        self.shared
            .link
            .send(Message::MetaSub {
                metas: subs.clone(),
                peer: self.shared.id.clone(),
            })
            .await?;
        next_matching(&mut rx, |m| matches!(m, Message::MetaSubed { .. })).await?;

        self.shared
            .link
            .send(Message::MetaPubReq {
                metas: subs.clone(),
                peer: self.shared.id.clone(),
            })
            .await?;
        next_matching(&mut rx, |m| matches!(m, Message::MetaPub { .. })).await?;

        loop {
            let all_present = subs.iter().all(|(user, repos)| {
                repos.keys().all(|repo| self.shared.state.contains(user, repo))
            });
            if all_present {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.shared.state.mark_subscribed(&subs);
        Ok(())
    }

    /// Remove repos from the stage and narrow the subscription.
    ///
    /// Publications already in flight may transiently reintroduce
    /// removed entries; the narrowed filter converges once the peer has
    /// applied it.
    pub async fn remove_repos(&self, repos: &[(String, RepoId)]) -> Result<()> {
        self.shared.state.remove(repos);

        let mut val = self.shared.current_value();
        for (user, repo) in repos {
            val.remove_repo(user, repo);
        }
        self.shared.publish_value(val);

        self.subscribe_repos(self.shared.state.config().subs).await
    }

    /// Stage transactions on a branch without committing.
    ///
    /// The append and the recomputed published value form one critical
    /// section with the loop's abort decision, so a staged transaction
    /// is never lost between them.
    pub async fn transact(
        &self,
        user: &str,
        repo: &RepoId,
        branch: &str,
        txs: Vec<Transaction>,
    ) -> Result<()> {
        let _guard = self.shared.tx_lock.lock().await;
        self.shared
            .state
            .append_transactions(user, repo, branch, txs)?;
        self.refresh_branch(user, repo, branch).await
    }

    /// Stage a binary payload routed through the blob-store function.
    pub async fn transact_binary(
        &self,
        user: &str,
        repo: &RepoId,
        branch: &str,
        blob: Vec<u8>,
    ) -> Result<()> {
        self.transact(user, repo, branch, vec![Transaction::binary(blob)])
            .await
    }

    /// Commit the staged transactions of every listed branch, then
    /// publish.
    pub async fn commit(&self, repos: &[(String, RepoId, String)]) -> Result<()> {
        {
            let _guard = self.shared.tx_lock.lock().await;
            for (user, repo, branch) in repos {
                let meta = self.require_meta(user, repo)?;
                let staged = self.shared.state.transactions(user, repo, branch);
                let outcome = pvcs_meta::commit(&meta, user, branch, &staged)?;
                self.store_blobs(&outcome.new_blobs).await?;
                self.shared.state.apply_commit(user, repo, branch, &outcome)?;
            }
        }

        for (user, repo, branch) in repos {
            self.refresh_branch(user, repo, branch).await?;
        }

        let metas = spec_from_triples(repos);
        sync(&self.shared.state, &self.shared.link, &self.shared.id, &metas).await?;
        self.shared.state.cleanup_ops_and_new_values(&metas);
        Ok(())
    }

    /// Merge the diverged heads of a branch.
    ///
    /// With `wait`, sleeps a uniform-random slice of the merge-cost
    /// window first, then rechecks that the history is still the one the
    /// caller saw — returning `false` (retrigger) if a concurrent update
    /// moved it. `heads_order` decides the merge commit's parent order
    /// within the divergent frontier only.
    pub async fn merge(
        &self,
        user: &str,
        repo: &RepoId,
        branch: &str,
        heads_order: &[CommitId],
        wait: bool,
    ) -> Result<bool> {
        let before = self.require_meta(user, repo)?;

        if wait {
            let cost = merge_cost(&before.causal);
            if cost > 0 {
                let backoff = rand::thread_rng().gen_range(0..cost);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }

        {
            let _guard = self.shared.tx_lock.lock().await;
            let current = self.require_meta(user, repo)?;
            if current.causal != before.causal {
                return Ok(false);
            }

            let outcome = pvcs_meta::merge(&current, user, branch, &current, heads_order)?;
            self.store_blobs(&outcome.new_blobs).await?;
            self.shared.state.apply_commit(user, repo, branch, &outcome)?;
        }

        self.refresh_branch(user, repo, branch).await?;

        let metas = publish_spec(user, repo, branch);
        sync(&self.shared.state, &self.shared.link, &self.shared.id, &metas).await?;
        self.shared.state.cleanup_ops_and_new_values(&metas);
        Ok(true)
    }

    fn require_meta(&self, user: &str, repo: &RepoId) -> Result<pvcs_meta::RepoMeta> {
        self.shared
            .state
            .meta(user, repo)
            .ok_or_else(|| StageError::UnknownRepo {
                user: user.to_string(),
                repo: repo.clone(),
            })
    }

    async fn store_blobs(&self, blobs: &[pvcs_meta::NewBlob]) -> Result<()> {
        for (_, blob) in blobs {
            self.shared.store.put(blob.clone()).await?;
        }
        Ok(())
    }

    /// Recompute one branch view from current state and publish it.
    async fn refresh_branch(&self, user: &str, repo: &RepoId, branch: &str) -> Result<()> {
        let meta = self.require_meta(user, repo)?;
        let staged = self.shared.state.transactions(user, repo, branch);

        let view = if meta.multiple_branch_heads(branch) {
            BranchView::Conflict(
                conflict::summarize_conflict(
                    &self.shared.store,
                    &self.shared.eval,
                    &self.shared.cache,
                    &meta,
                    branch,
                )
                .await?,
            )
        } else {
            BranchView::Value(
                branch_value(
                    &self.shared.store,
                    &self.shared.eval,
                    &self.shared.cache,
                    &meta,
                    branch,
                    &staged,
                )
                .await?,
            )
        };

        let mut val = self.shared.current_value();
        val.set(user, repo, branch, view);
        self.shared.publish_value(val);
        Ok(())
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.loop_task.abort();
    }
}

fn publish_spec(user: &str, repo: &RepoId, branch: &str) -> SubSpec {
    SubSpec::from([(
        user.to_string(),
        BTreeMap::from([(repo.clone(), BTreeSet::from([branch.to_string()]))]),
    )])
}

fn spec_from_triples(repos: &[(String, RepoId, String)]) -> SubSpec {
    let mut spec = SubSpec::new();
    for (user, repo, branch) in repos {
        spec.entry(user.clone())
            .or_default()
            .entry(repo.clone())
            .or_default()
            .insert(branch.clone());
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_cost_is_zero_without_merges_and_grows_with_them() {
        let mut causal = CausalOrder::new();
        let id = |n: u8| pvcs_store::Hash::digest(&[n]);
        causal.insert(id(0), vec![]);
        causal.insert(id(1), vec![id(0)]);
        assert_eq!(merge_cost(&causal), 0);

        causal.insert(id(2), vec![id(0)]);
        causal.insert(id(3), vec![id(1), id(2)]);
        let one_merge = merge_cost(&causal);
        assert!(one_merge > 0);

        causal.insert(id(4), vec![id(0)]);
        causal.insert(id(5), vec![id(3), id(4)]);
        assert!(merge_cost(&causal) > one_merge);
    }
}
