//! The stage's in-memory state and its atomic mutators.
//!
//! One map `user → repo → entry` plus the stage configuration, behind a
//! single lock. Mutators take the write lock for the whole mutation, so
//! every reader observes either the state before or after — never a
//! half-applied change. Critical sections are short and never suspend.

use crate::error::{Result, StageError};
use pvcs_meta::{CommitOutcome, NewBlob, RepoId, RepoMeta, Transaction};
use pvcs_store::{Blob, Hash};
use pvcs_wire::{MetaMap, SubSpec};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Last operation on a repo in the current sync cycle; decides what a
/// `sync` publishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Op {
    /// Nothing to publish.
    #[default]
    None,

    /// Locally created history awaiting publication.
    MetaPub,

    /// Subscribed metadata to re-announce.
    MetaSub,
}

/// Everything the stage tracks for one repository.
#[derive(Clone, Debug)]
pub struct RepoEntry {
    /// The repository metadata.
    pub meta: RepoMeta,

    /// Staged, uncommitted transactions per branch, in submission order.
    pub transactions: BTreeMap<String, Vec<Transaction>>,

    /// Blobs produced locally per branch that remote peers may fetch.
    pub new_values: BTreeMap<String, BTreeMap<Hash, Blob>>,

    /// Last operation tag for this repo.
    pub op: Op,
}

impl RepoEntry {
    /// Entry for freshly installed metadata.
    pub fn new(meta: RepoMeta) -> Self {
        RepoEntry {
            meta,
            transactions: BTreeMap::new(),
            new_values: BTreeMap::new(),
            op: Op::None,
        }
    }

    /// Entry for a locally created repository: carries its minted blobs
    /// and is marked for publication.
    pub fn created(meta: RepoMeta, branch: &str, blobs: Vec<NewBlob>) -> Self {
        let mut entry = Self::new(meta);
        entry
            .new_values
            .insert(branch.to_string(), blobs.into_iter().collect());
        entry.op = Op::MetaPub;
        entry
    }
}

/// Stage configuration singletons.
#[derive(Clone, Debug, Default)]
pub struct StageConfig {
    /// Stage identity, used as the host tag on publications.
    pub id: String,

    /// The local user.
    pub user: String,

    /// Current subscription set.
    pub subs: SubSpec,
}

/// A consistent snapshot of the stage state.
#[derive(Clone, Debug, Default)]
pub struct StageData {
    /// `user → repo → entry`.
    pub repos: BTreeMap<String, BTreeMap<RepoId, RepoEntry>>,

    /// Configuration singletons.
    pub config: StageConfig,
}

/// One repo's metadata transition from an incoming publication.
#[derive(Clone, Debug)]
pub struct MetaChange {
    pub user: String,
    pub repo: RepoId,
    pub old: Option<RepoMeta>,
    pub new: RepoMeta,
}

/// The stage state cell.
pub struct StageState {
    data: RwLock<StageData>,
}

impl StageState {
    /// Create a state with the given configuration.
    pub fn new(config: StageConfig) -> Self {
        StageState {
            data: RwLock::new(StageData {
                repos: BTreeMap::new(),
                config,
            }),
        }
    }

    /// Clone out a consistent snapshot.
    pub fn snapshot(&self) -> StageData {
        self.data.read().clone()
    }

    /// Current configuration.
    pub fn config(&self) -> StageConfig {
        self.data.read().config.clone()
    }

    /// Metadata of one repo, if visible.
    pub fn meta(&self, user: &str, repo: &RepoId) -> Option<RepoMeta> {
        self.data
            .read()
            .repos
            .get(user)?
            .get(repo)
            .map(|e| e.meta.clone())
    }

    /// Check whether a `(user, repo)` entry exists.
    pub fn contains(&self, user: &str, repo: &RepoId) -> bool {
        self.data
            .read()
            .repos
            .get(user)
            .map(|r| r.contains_key(repo))
            .unwrap_or(false)
    }

    /// Staged transactions of one branch.
    pub fn transactions(&self, user: &str, repo: &RepoId, branch: &str) -> Vec<Transaction> {
        self.data
            .read()
            .repos
            .get(user)
            .and_then(|r| r.get(repo))
            .and_then(|e| e.transactions.get(branch))
            .cloned()
            .unwrap_or_default()
    }

    /// Install a new repo entry. Fails when the slot is taken.
    pub fn install_repo(&self, user: &str, repo: &RepoId, entry: RepoEntry) -> Result<()> {
        let mut data = self.data.write();
        let repos = data.repos.entry(user.to_string()).or_default();
        if repos.contains_key(repo) {
            return Err(StageError::RepoAlreadyExists {
                user: user.to_string(),
                repo: repo.clone(),
            });
        }
        repos.insert(repo.clone(), entry);
        Ok(())
    }

    /// Append staged transactions, in submission order.
    ///
    /// Requires a live subscription for the branch — a staged
    /// transaction on an unsubscribed branch could never be invalidated
    /// by incoming history, because none would arrive.
    pub fn append_transactions(
        &self,
        user: &str,
        repo: &RepoId,
        branch: &str,
        txs: Vec<Transaction>,
    ) -> Result<()> {
        let mut data = self.data.write();

        let subscribed = data
            .config
            .subs
            .get(user)
            .and_then(|r| r.get(repo))
            .map(|branches| branches.contains(branch))
            .unwrap_or(false);
        if !subscribed {
            return Err(StageError::NotSubscribed {
                user: user.to_string(),
                repo: repo.clone(),
                branch: branch.to_string(),
            });
        }

        let entry = data
            .repos
            .get_mut(user)
            .and_then(|r| r.get_mut(repo))
            .ok_or_else(|| StageError::UnknownRepo {
                user: user.to_string(),
                repo: repo.clone(),
            })?;
        entry
            .transactions
            .entry(branch.to_string())
            .or_default()
            .extend(txs);
        Ok(())
    }

    /// Clear and return one branch's staged transactions.
    pub fn take_transactions(&self, user: &str, repo: &RepoId, branch: &str) -> Vec<Transaction> {
        let mut data = self.data.write();
        data.repos
            .get_mut(user)
            .and_then(|r| r.get_mut(repo))
            .and_then(|e| e.transactions.remove(branch))
            .unwrap_or_default()
    }

    /// Apply a commit outcome: new metadata in, staged transactions out,
    /// minted blobs queued for fetching peers, repo marked for
    /// publication. One write-lock hold, so the transition is atomic.
    ///
    /// The outcome merges through the metadata union rather than
    /// replacing the entry: a remote update that arrived between the
    /// caller's snapshot and this application survives as a sibling
    /// head instead of being dropped.
    pub fn apply_commit(
        &self,
        user: &str,
        repo: &RepoId,
        branch: &str,
        outcome: &CommitOutcome,
    ) -> Result<()> {
        let mut data = self.data.write();
        let entry = data
            .repos
            .get_mut(user)
            .and_then(|r| r.get_mut(repo))
            .ok_or_else(|| StageError::UnknownRepo {
                user: user.to_string(),
                repo: repo.clone(),
            })?;
        entry.meta = entry.meta.update(&outcome.meta);
        entry.transactions.remove(branch);
        entry
            .new_values
            .entry(branch.to_string())
            .or_default()
            .extend(outcome.new_blobs.iter().cloned());
        entry.op = Op::MetaPub;
        Ok(())
    }

    /// Reset op tags and drop served blobs after a completed sync.
    pub fn cleanup_ops_and_new_values(&self, metas: &SubSpec) {
        let mut data = self.data.write();
        for (user, repos) in metas {
            for (repo, branches) in repos {
                if let Some(entry) = data.repos.get_mut(user).and_then(|r| r.get_mut(repo)) {
                    entry.op = Op::None;
                    for branch in branches {
                        entry.new_values.remove(branch);
                    }
                }
            }
        }
    }

    /// Merge an incoming publication into the state.
    ///
    /// Present entries merge through the metadata union; absent ones
    /// install as-is. Returns the transitions whose metadata actually
    /// changed, for value recomputation.
    pub fn apply_meta_pub(&self, metas: &MetaMap) -> Vec<MetaChange> {
        let mut changes = Vec::new();
        let mut data = self.data.write();

        for (user, repos) in metas {
            for (repo, incoming) in repos {
                let slot = data
                    .repos
                    .entry(user.clone())
                    .or_default()
                    .entry(repo.clone());
                use std::collections::btree_map::Entry;
                match slot {
                    Entry::Occupied(mut occupied) => {
                        let old = occupied.get().meta.clone();
                        let merged = old.update(incoming);
                        if merged != old {
                            occupied.get_mut().meta = merged.clone();
                            changes.push(MetaChange {
                                user: user.clone(),
                                repo: repo.clone(),
                                old: Some(old),
                                new: merged,
                            });
                        }
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(RepoEntry::new(incoming.clone()));
                        changes.push(MetaChange {
                            user: user.clone(),
                            repo: repo.clone(),
                            old: None,
                            new: incoming.clone(),
                        });
                    }
                }
            }
        }

        changes
    }

    /// Remove entries and their subscriptions.
    pub fn remove(&self, repos: &[(String, RepoId)]) {
        let mut data = self.data.write();
        for (user, repo) in repos {
            let emptied = data
                .repos
                .get_mut(user)
                .map(|user_repos| {
                    user_repos.remove(repo);
                    user_repos.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                data.repos.remove(user);
            }

            let emptied = data
                .config
                .subs
                .get_mut(user)
                .map(|user_subs| {
                    user_subs.remove(repo);
                    user_subs.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                data.config.subs.remove(user);
            }
        }
    }

    /// Replace the subscription set.
    pub fn set_subs(&self, subs: SubSpec) {
        self.data.write().config.subs = subs;
    }

    /// Add one branch subscription.
    pub fn add_sub(&self, user: &str, repo: &RepoId, branch: &str) {
        let mut data = self.data.write();
        data.config
            .subs
            .entry(user.to_string())
            .or_default()
            .entry(repo.clone())
            .or_default()
            .insert(branch.to_string());
    }

    /// Tag subscribed entries for re-announcement by the next sync.
    pub fn mark_subscribed(&self, subs: &SubSpec) {
        let mut data = self.data.write();
        for (user, repos) in subs {
            for repo in repos.keys() {
                if let Some(entry) = data.repos.get_mut(user).and_then(|r| r.get_mut(repo)) {
                    if entry.op == Op::None {
                        entry.op = Op::MetaSub;
                    }
                }
            }
        }
    }

    /// Union of the served blobs for a publication spec (sync step 2).
    pub fn new_values_for(&self, metas: &SubSpec) -> BTreeMap<Hash, Blob> {
        let data = self.data.read();
        let mut union = BTreeMap::new();
        for (user, repos) in metas {
            for (repo, branches) in repos {
                if let Some(entry) = data.repos.get(user).and_then(|r| r.get(repo)) {
                    for branch in branches {
                        if let Some(blobs) = entry.new_values.get(branch) {
                            union.extend(blobs.iter().map(|(h, b)| (*h, b.clone())));
                        }
                    }
                }
            }
        }
        union
    }

    /// Metadata to publish for a spec: repos whose last op was a
    /// publication or subscription (sync step 3).
    pub fn meta_pubs_for(&self, metas: &SubSpec) -> MetaMap {
        let data = self.data.read();
        let mut pubs = MetaMap::new();
        for (user, repos) in metas {
            for repo in repos.keys() {
                if let Some(entry) = data.repos.get(user).and_then(|r| r.get(repo)) {
                    if entry.op != Op::None {
                        pubs.entry(user.clone())
                            .or_default()
                            .insert(repo.clone(), entry.meta.clone());
                    }
                }
            }
        }
        pubs
    }
}
