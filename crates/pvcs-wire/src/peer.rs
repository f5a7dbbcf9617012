//! In-process peer fabric.
//!
//! `LocalPeer` plays the role of the gossip peer a stage talks to: it
//! tracks per-stage subscription filters, caches published metadata,
//! pulls the blobs behind a publication from the publishing stage into
//! its store, acknowledges, and relays publications to the other
//! connected stages — never back to the stage a publication came from.

use crate::link::PeerLink;
use crate::message::{filter_metas, Message, MetaMap, SubSpec};
use parking_lot::RwLock;
use pvcs_meta::CommitObject;
use pvcs_store::{blob_trans_id, Blob, BlobStore, Hash, MemoryBlobStore, SharedStore};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

const OUTBOUND_CAPACITY: usize = 64;
const INBOX_CAPACITY: usize = 256;

struct StageSlot {
    inbox: broadcast::Sender<Message>,
    subs: SubSpec,
}

struct PeerShared {
    name: String,
    store: SharedStore,
    metas: RwLock<MetaMap>,
    stages: RwLock<HashMap<String, StageSlot>>,
    ack_delay: RwLock<Option<Duration>>,
}

/// An in-process peer serving any number of local stages.
#[derive(Clone)]
pub struct LocalPeer {
    shared: Arc<PeerShared>,
}

impl LocalPeer {
    /// Create a peer with a fresh in-memory store.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_store(name, MemoryBlobStore::shared())
    }

    /// Create a peer over an existing store.
    pub fn with_store(name: impl Into<String>, store: SharedStore) -> Self {
        LocalPeer {
            shared: Arc::new(PeerShared {
                name: name.into(),
                store,
                metas: RwLock::new(MetaMap::new()),
                stages: RwLock::new(HashMap::new()),
                ack_delay: RwLock::new(None),
            }),
        }
    }

    /// The store this peer fetches published blobs into. Stages connected
    /// to this peer materialize from the same store.
    pub fn store(&self) -> SharedStore {
        self.shared.store.clone()
    }

    /// Delay publication acknowledgements. Test hook for the ack-timeout
    /// path of the sync driver.
    pub fn set_ack_delay(&self, delay: Duration) {
        *self.shared.ack_delay.write() = Some(delay);
    }

    /// Snapshot of the cached metadata.
    pub fn cached_metas(&self) -> MetaMap {
        self.shared.metas.read().clone()
    }

    /// Connect a stage, spawning its handler task.
    pub fn connect_stage(&self, stage_id: impl Into<String>) -> PeerLink {
        let stage_id = stage_id.into();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbox_tx, _) = broadcast::channel(INBOX_CAPACITY);

        self.shared.stages.write().insert(
            stage_id.clone(),
            StageSlot {
                inbox: inbox_tx.clone(),
                subs: SubSpec::new(),
            },
        );

        tokio::spawn(handle_stage(self.shared.clone(), stage_id, out_rx));

        PeerLink::new(out_tx, inbox_tx)
    }
}

fn send_to(shared: &PeerShared, stage_id: &str, msg: Message) {
    let stages = shared.stages.read();
    if let Some(slot) = stages.get(stage_id) {
        // A send only fails when the stage holds no receiver; nothing to
        // do about that here.
        let _ = slot.inbox.send(msg);
    }
}

async fn handle_stage(
    shared: Arc<PeerShared>,
    stage_id: String,
    mut rx: mpsc::Receiver<Message>,
) {
    let mut deferred: VecDeque<Message> = VecDeque::new();

    loop {
        let msg = match deferred.pop_front() {
            Some(m) => m,
            None => match rx.recv().await {
                Some(m) => m,
                None => break,
            },
        };

        debug!(stage = %stage_id, topic = msg.topic(), "peer received");

        match msg {
            Message::Connect { url } => {
                send_to(&shared, &stage_id, Message::Connected { url });
            }
            Message::MetaSub { metas, .. } => {
                if let Some(slot) = shared.stages.write().get_mut(&stage_id) {
                    slot.subs = metas;
                }
                send_to(
                    &shared,
                    &stage_id,
                    Message::MetaSubed {
                        peer: shared.name.clone(),
                    },
                );
            }
            Message::MetaPubReq { metas, .. } => {
                let cached = filter_metas(&shared.metas.read(), &metas);
                send_to(
                    &shared,
                    &stage_id,
                    Message::MetaPub {
                        metas: cached,
                        peer: shared.name.clone(),
                        host: None,
                    },
                );
            }
            Message::MetaPub { metas, host, .. } => {
                handle_publication(&shared, &stage_id, &mut rx, &mut deferred, metas, host)
                    .await;
            }
            // Ack from a stage we relayed a publication to.
            Message::MetaPubed { .. } => {}
            other => {
                debug!(topic = other.topic(), "ignoring out-of-conversation message");
            }
        }
    }

    shared.stages.write().remove(&stage_id);
    debug!(stage = %stage_id, "stage disconnected");
}

/// Process one publication from a stage: cache, fetch blobs, ack, relay.
async fn handle_publication(
    shared: &PeerShared,
    stage_id: &str,
    rx: &mut mpsc::Receiver<Message>,
    deferred: &mut VecDeque<Message>,
    metas: MetaMap,
    host: Option<String>,
) {
    // Merge into the cache.
    {
        let mut cache = shared.metas.write();
        for (user, repos) in &metas {
            let user_cache = cache.entry(user.clone()).or_default();
            for (repo, meta) in repos {
                match user_cache.get_mut(repo) {
                    Some(existing) => *existing = existing.update(meta),
                    None => {
                        user_cache.insert(repo.clone(), meta.clone());
                    }
                }
            }
        }
    }

    // Round one: fetch unknown commit objects.
    let mut want = BTreeSet::new();
    for repos in metas.values() {
        for meta in repos.values() {
            for commit in meta.causal.commits() {
                if !shared.store.contains(commit).await {
                    want.insert(*commit);
                }
            }
        }
    }

    let fetched_commits = if want.is_empty() {
        BTreeMap::new()
    } else {
        send_to(
            shared,
            stage_id,
            Message::Fetch { ids: want.clone() },
        );
        let values = await_fetched(rx, deferred).await;
        for blob in values.values() {
            let _ = shared.store.put(blob.clone()).await;
        }
        values
    };

    // Round two: fetch the parameters and function sources the new
    // commits reference. Parameters of blob-marker transactions are
    // binary and travel one message each.
    let mut json_want = BTreeSet::new();
    let mut binary_want = BTreeSet::new();
    for (id, blob) in &fetched_commits {
        let Ok(commit) = CommitObject::from_blob(*id, blob) else {
            continue;
        };
        for (param_id, fn_id) in &commit.transactions {
            if *fn_id == blob_trans_id() {
                if !shared.store.contains(param_id).await {
                    binary_want.insert(*param_id);
                }
            } else {
                if !shared.store.contains(param_id).await {
                    json_want.insert(*param_id);
                }
                if !shared.store.contains(fn_id).await {
                    json_want.insert(*fn_id);
                }
            }
        }
    }

    if !json_want.is_empty() {
        send_to(shared, stage_id, Message::Fetch { ids: json_want });
        let values = await_fetched(rx, deferred).await;
        for blob in values.values() {
            let _ = shared.store.put(blob.clone()).await;
        }
    }

    if !binary_want.is_empty() {
        send_to(
            shared,
            stage_id,
            Message::BinaryFetch {
                ids: binary_want.clone(),
            },
        );
        let mut remaining = binary_want.len();
        while remaining > 0 {
            let Some(blob) = await_binary_fetched(rx, deferred).await else {
                break;
            };
            let _ = shared.store.put(blob).await;
            remaining -= 1;
        }
    }

    // Acknowledge the publication.
    let delay = *shared.ack_delay.read();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    send_to(
        shared,
        stage_id,
        Message::MetaPubed {
            peer: shared.name.clone(),
        },
    );

    // Relay to the other stages, filtered by their subscriptions and
    // never back to the originating host.
    let targets: Vec<(String, broadcast::Sender<Message>, MetaMap)> = {
        let stages = shared.stages.read();
        stages
            .iter()
            .filter(|(id, _)| id.as_str() != stage_id && Some(id.as_str()) != host.as_deref())
            .filter_map(|(id, slot)| {
                let filtered = filter_metas(&metas, &slot.subs);
                if filtered.is_empty() {
                    None
                } else {
                    Some((id.clone(), slot.inbox.clone(), filtered))
                }
            })
            .collect()
    };

    for (id, inbox, filtered) in targets {
        debug!(to = %id, "relaying publication");
        let _ = inbox.send(Message::MetaPub {
            metas: filtered,
            peer: shared.name.clone(),
            host: host.clone(),
        });
    }
}

/// Wait for the `Fetched` reply of an in-flight fetch, deferring
/// unrelated traffic.
async fn await_fetched(
    rx: &mut mpsc::Receiver<Message>,
    deferred: &mut VecDeque<Message>,
) -> BTreeMap<Hash, Blob> {
    loop {
        match rx.recv().await {
            Some(Message::Fetched { values, .. }) => return values,
            Some(other) => deferred.push_back(other),
            None => return BTreeMap::new(),
        }
    }
}

/// Wait for one `BinaryFetched` reply, deferring unrelated traffic.
async fn await_binary_fetched(
    rx: &mut mpsc::Receiver<Message>,
    deferred: &mut VecDeque<Message>,
) -> Option<Blob> {
    loop {
        match rx.recv().await {
            Some(Message::BinaryFetched { value, .. }) => return Some(value),
            Some(other) => deferred.push_back(other),
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::next_matching;
    use pvcs_meta::{new_repository, RepoId};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn subs_for(user: &str, repo: &RepoId, branch: &str) -> SubSpec {
        BTreeMap::from([(
            user.to_string(),
            BTreeMap::from([(repo.clone(), BTreeSet::from([branch.to_string()]))]),
        )])
    }

    #[tokio::test]
    async fn connect_is_acked_with_matching_url() {
        let peer = LocalPeer::new("peer-1");
        let link = peer.connect_stage("stage-a");
        let mut rx = link.subscribe();

        link.send(Message::Connect {
            url: "mem://hub".to_string(),
        })
        .await
        .unwrap();

        let msg = next_matching(&mut rx, |m| m.topic() == "connected")
            .await
            .unwrap();
        assert_eq!(
            msg,
            Message::Connected {
                url: "mem://hub".to_string()
            }
        );
    }

    #[tokio::test]
    async fn meta_sub_is_acked_and_recorded() {
        let peer = LocalPeer::new("peer-1");
        let link = peer.connect_stage("stage-a");
        let mut rx = link.subscribe();
        let repo = RepoId::new("r1");

        link.send(Message::MetaSub {
            metas: subs_for("john", &repo, "master"),
            peer: "stage-a".to_string(),
        })
        .await
        .unwrap();

        let msg = next_matching(&mut rx, |m| m.topic() == "meta-subed")
            .await
            .unwrap();
        assert_eq!(
            msg,
            Message::MetaSubed {
                peer: "peer-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn publication_is_fetched_acked_and_relayed() {
        let peer = LocalPeer::new("peer-1");
        let publisher = peer.connect_stage("stage-a");
        let subscriber = peer.connect_stage("stage-b");

        let (meta, _, new_blobs) =
            new_repository("john", "demo", false, json!({"init": 43}), "master");
        let repo = meta.id.clone();

        // stage-b subscribes to john's repo.
        let mut sub_rx = subscriber.subscribe();
        subscriber
            .send(Message::MetaSub {
                metas: subs_for("john", &repo, "master"),
                peer: "stage-b".to_string(),
            })
            .await
            .unwrap();
        next_matching(&mut sub_rx, |m| m.topic() == "meta-subed")
            .await
            .unwrap();

        // stage-a publishes and serves the peer's fetch.
        let mut pub_rx = publisher.subscribe();
        let metas: MetaMap = BTreeMap::from([(
            "john".to_string(),
            BTreeMap::from([(repo.clone(), meta.clone())]),
        )]);
        publisher
            .send(Message::MetaPub {
                metas,
                peer: "stage-a".to_string(),
                host: Some("stage-a".to_string()),
            })
            .await
            .unwrap();

        let fetch = next_matching(&mut pub_rx, |m| m.topic() == "fetch")
            .await
            .unwrap();
        let Message::Fetch { ids } = fetch else {
            unreachable!()
        };
        let values: BTreeMap<Hash, Blob> = new_blobs
            .iter()
            .filter(|(id, _)| ids.contains(id))
            .cloned()
            .collect();
        publisher
            .send(Message::Fetched {
                values,
                peer: "stage-a".to_string(),
            })
            .await
            .unwrap();

        // Second fetch round pulls the referenced param and fn blobs.
        let fetch = next_matching(&mut pub_rx, |m| m.topic() == "fetch")
            .await
            .unwrap();
        let Message::Fetch { ids } = fetch else {
            unreachable!()
        };
        let values: BTreeMap<Hash, Blob> = new_blobs
            .iter()
            .filter(|(id, _)| ids.contains(id))
            .cloned()
            .collect();
        publisher
            .send(Message::Fetched {
                values,
                peer: "stage-a".to_string(),
            })
            .await
            .unwrap();

        // Publisher is acked; subscriber sees the relayed publication.
        next_matching(&mut pub_rx, |m| m.topic() == "meta-pubed")
            .await
            .unwrap();
        let relayed = next_matching(&mut sub_rx, |m| m.topic() == "meta-pub")
            .await
            .unwrap();
        let Message::MetaPub { metas, host, .. } = relayed else {
            unreachable!()
        };
        assert_eq!(host.as_deref(), Some("stage-a"));
        assert_eq!(metas["john"][&repo], meta);

        // All published blobs landed in the peer's store.
        for (id, _) in &new_blobs {
            assert!(peer.store().contains(id).await);
        }
    }

    #[tokio::test]
    async fn meta_pub_req_replies_from_cache() {
        let peer = LocalPeer::new("peer-1");
        let link = peer.connect_stage("stage-a");
        let mut rx = link.subscribe();

        let (meta, _, _) = new_repository("john", "demo", false, json!({}), "master");
        let repo = meta.id.clone();
        peer.shared
            .metas
            .write()
            .entry("john".to_string())
            .or_default()
            .insert(repo.clone(), meta.clone());

        link.send(Message::MetaPubReq {
            metas: subs_for("john", &repo, "master"),
            peer: "stage-a".to_string(),
        })
        .await
        .unwrap();

        let msg = next_matching(&mut rx, |m| m.topic() == "meta-pub")
            .await
            .unwrap();
        let Message::MetaPub { metas, host, .. } = msg else {
            unreachable!()
        };
        assert_eq!(host, None);
        assert_eq!(metas["john"][&repo], meta);
    }
}
