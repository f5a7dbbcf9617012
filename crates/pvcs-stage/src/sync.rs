//! The publish side of the stage ↔ peer protocol.

use crate::error::Result;
use crate::state::StageState;
use pvcs_wire::{Message, PeerLink, SubSpec};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// How long to wait for the publication acknowledgement before warning.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Push the repos named by `metas` to the peer.
///
/// Publishes the metadata of every repo whose last op left something to
/// announce, then serves the peer's `fetch` / `binary-fetch` requests
/// out of the staged new-values until the publication is acknowledged.
/// The inbox subscription is taken before publishing, so a fetch that
/// races the publication cannot be missed.
///
/// The acknowledgement wait warns after ten seconds and then keeps
/// waiting; a slow peer delays the caller but loses nothing.
pub async fn sync(
    state: &StageState,
    link: &PeerLink,
    stage_id: &str,
    metas: &SubSpec,
) -> Result<()> {
    let mut rx = link.subscribe();

    let new_values = state.new_values_for(metas);
    let meta_pubs = state.meta_pubs_for(metas);

    if meta_pubs.is_empty() {
        debug!("nothing to publish");
        return Ok(());
    }

    link.send(Message::MetaPub {
        metas: meta_pubs,
        peer: stage_id.to_string(),
        host: Some(stage_id.to_string()),
    })
    .await?;

    let deadline = Instant::now() + ACK_TIMEOUT;
    let mut warned = false;

    loop {
        let next = pvcs_wire::next_matching(&mut rx, |m| {
            matches!(
                m,
                Message::MetaPubed { .. } | Message::Fetch { .. } | Message::BinaryFetch { .. }
            )
        });

        let msg = if warned {
            next.await?
        } else {
            match timeout_at(deadline, next).await {
                Ok(msg) => msg?,
                Err(_) => {
                    warn!("No meta-pubed ack received after 10 secs. Continue waiting...");
                    warned = true;
                    continue;
                }
            }
        };

        match msg {
            Message::MetaPubed { .. } => break,
            Message::Fetch { ids } => {
                let values: BTreeMap<_, _> = new_values
                    .iter()
                    .filter(|(id, _)| ids.contains(*id))
                    .map(|(id, blob)| (*id, blob.clone()))
                    .collect();
                debug!(requested = ids.len(), served = values.len(), "serving fetch");
                link.send(Message::Fetched {
                    values,
                    peer: stage_id.to_string(),
                })
                .await?;
            }
            Message::BinaryFetch { ids } => {
                for id in ids {
                    if let Some(blob) = new_values.get(&id) {
                        link.send(Message::BinaryFetched {
                            value: blob.clone(),
                            peer: stage_id.to_string(),
                        })
                        .await?;
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}
