//! Topic-tagged messages exchanged between a stage and its peer.

use pvcs_meta::{RepoId, RepoMeta};
use pvcs_store::{Blob, Hash};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What to publish or subscribe: `user → repo → branches`.
pub type SubSpec = BTreeMap<String, BTreeMap<RepoId, BTreeSet<String>>>;

/// Published repository metadata: `user → repo → meta`.
pub type MetaMap = BTreeMap<String, BTreeMap<RepoId, RepoMeta>>;

/// Messages of the peer wire protocol, one variant per topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Ask the peer fabric to reach a remote peer.
    Connect { url: String },

    /// Connection acknowledgement, echoing the url.
    Connected { url: String },

    /// Replace the sender's subscription filter.
    MetaSub { metas: SubSpec, peer: String },

    /// Subscription acknowledgement.
    MetaSubed { peer: String },

    /// Request a publication of the named metadata.
    MetaPubReq { metas: SubSpec, peer: String },

    /// Repository metadata publication.
    ///
    /// `host` names the stage a publication originated from; the block
    /// detector uses it to keep a stage from receiving its own
    /// publications back.
    MetaPub {
        metas: MetaMap,
        peer: String,
        host: Option<String>,
    },

    /// Publication acknowledgement.
    MetaPubed { peer: String },

    /// Request commit, parameter and function-source blobs.
    Fetch { ids: BTreeSet<Hash> },

    /// Reply to a fetch: the requested blobs the sender holds.
    Fetched {
        values: BTreeMap<Hash, Blob>,
        peer: String,
    },

    /// Request binary payloads.
    BinaryFetch { ids: BTreeSet<Hash> },

    /// One binary payload; its content address identifies which request
    /// entry it answers.
    BinaryFetched { value: Blob, peer: String },
}

impl Message {
    /// The topic name of this message, for filtering and logging.
    pub fn topic(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "connect",
            Message::Connected { .. } => "connected",
            Message::MetaSub { .. } => "meta-sub",
            Message::MetaSubed { .. } => "meta-subed",
            Message::MetaPubReq { .. } => "meta-pub-req",
            Message::MetaPub { .. } => "meta-pub",
            Message::MetaPubed { .. } => "meta-pubed",
            Message::Fetch { .. } => "fetch",
            Message::Fetched { .. } => "fetched",
            Message::BinaryFetch { .. } => "binary-fetch",
            Message::BinaryFetched { .. } => "binary-fetched",
        }
    }
}

/// Check whether a subscription spec covers a `(user, repo)` pair.
pub fn covers(subs: &SubSpec, user: &str, repo: &RepoId) -> bool {
    subs.get(user)
        .map(|repos| repos.contains_key(repo))
        .unwrap_or(false)
}

/// Restrict a metadata map to the entries a subscription spec covers.
pub fn filter_metas(metas: &MetaMap, subs: &SubSpec) -> MetaMap {
    let mut filtered = MetaMap::new();
    for (user, repos) in metas {
        for (repo, meta) in repos {
            if covers(subs, user, repo) {
                filtered
                    .entry(user.clone())
                    .or_default()
                    .insert(repo.clone(), meta.clone());
            }
        }
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(user: &str, repo: &RepoId, branch: &str) -> SubSpec {
        BTreeMap::from([(
            user.to_string(),
            BTreeMap::from([(repo.clone(), BTreeSet::from([branch.to_string()]))]),
        )])
    }

    #[test]
    fn topics_match_variants() {
        let msg = Message::MetaPubed {
            peer: "stage-1".to_string(),
        };
        assert_eq!(msg.topic(), "meta-pubed");

        let msg = Message::Fetch {
            ids: BTreeSet::new(),
        };
        assert_eq!(msg.topic(), "fetch");
    }

    #[test]
    fn covers_is_per_user_and_repo() {
        let repo = RepoId::new("r1");
        let other = RepoId::new("r2");
        let subs = spec("john", &repo, "master");

        assert!(covers(&subs, "john", &repo));
        assert!(!covers(&subs, "john", &other));
        assert!(!covers(&subs, "jane", &repo));
    }

    #[test]
    fn filter_metas_drops_unsubscribed_entries() {
        let repo = RepoId::new("r1");
        let other = RepoId::new("r2");
        let (meta, _, _) = pvcs_meta::new_repository(
            "john",
            "test",
            false,
            serde_json::json!({}),
            "master",
        );

        let mut metas = MetaMap::new();
        metas.entry("john".to_string()).or_default().insert(
            repo.clone(),
            RepoMeta {
                id: repo.clone(),
                ..meta.clone()
            },
        );
        metas.entry("john".to_string()).or_default().insert(
            other.clone(),
            RepoMeta {
                id: other,
                ..meta
            },
        );

        let filtered = filter_metas(&metas, &spec("john", &repo, "master"));
        assert_eq!(filtered["john"].len(), 1);
        assert!(filtered["john"].contains_key(&repo));
    }
}
