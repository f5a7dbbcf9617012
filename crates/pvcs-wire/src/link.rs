//! The stage's channel pair to its peer.

use crate::message::Message;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Buffer sizes for the two directions.
const OUTBOUND_CAPACITY: usize = 64;
const INBOX_CAPACITY: usize = 256;

/// Errors surfaced by the wire layer.
#[derive(Error, Debug, Clone)]
pub enum WireError {
    #[error("peer channel closed")]
    ChannelClosed,
}

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// A stage's connection to its peer: an outbound sender and an inbound
/// broadcast every interested task can subscribe to.
///
/// Inbound fan-out is broadcast so the stage loop, the sync driver and
/// one-shot waits (connect, subscribe) can each follow the topics they
/// care about. Subscribe before triggering the traffic you want to see;
/// a broadcast only reaches receivers that already exist.
#[derive(Clone)]
pub struct PeerLink {
    out: mpsc::Sender<Message>,
    inbox: broadcast::Sender<Message>,
}

impl PeerLink {
    /// Build a link from raw channel ends. Used by peer fabrics.
    pub fn new(out: mpsc::Sender<Message>, inbox: broadcast::Sender<Message>) -> Self {
        PeerLink { out, inbox }
    }

    /// Create an unconnected link plus the remote ends, for tests that
    /// script the peer side by hand.
    pub fn pair() -> (Self, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbox_tx, _) = broadcast::channel(INBOX_CAPACITY);
        let link = PeerLink::new(out_tx, inbox_tx.clone());
        let remote = RemoteEnd {
            incoming: out_rx,
            reply: inbox_tx,
        };
        (link, remote)
    }

    /// Send a message to the peer.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.out.send(msg).await.map_err(|_| WireError::ChannelClosed)
    }

    /// Subscribe to inbound messages.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inbox.subscribe()
    }
}

/// The peer-side ends of a [`PeerLink::pair`].
pub struct RemoteEnd {
    /// Messages the stage sent.
    pub incoming: mpsc::Receiver<Message>,

    /// Sender into the stage's inbox.
    pub reply: broadcast::Sender<Message>,
}

/// Await the next inbound message matching a predicate.
///
/// Lagged receivers skip ahead; a closed channel surfaces as
/// [`WireError::ChannelClosed`].
pub async fn next_matching(
    rx: &mut broadcast::Receiver<Message>,
    mut pred: impl FnMut(&Message) -> bool,
) -> Result<Message> {
    loop {
        match rx.recv().await {
            Ok(msg) if pred(&msg) => return Ok(msg),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "inbox receiver lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Err(WireError::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_reaches_remote_end() {
        let (link, mut remote) = PeerLink::pair();

        link.send(Message::Connect {
            url: "mem://peer".to_string(),
        })
        .await
        .unwrap();

        let msg = remote.incoming.recv().await.unwrap();
        assert_eq!(msg.topic(), "connect");
    }

    #[tokio::test]
    async fn next_matching_filters_topics() {
        let (link, remote) = PeerLink::pair();
        let mut rx = link.subscribe();

        remote
            .reply
            .send(Message::MetaSubed {
                peer: "p".to_string(),
            })
            .unwrap();
        remote
            .reply
            .send(Message::MetaPubed {
                peer: "p".to_string(),
            })
            .unwrap();

        let msg = next_matching(&mut rx, |m| m.topic() == "meta-pubed")
            .await
            .unwrap();
        assert_eq!(msg.topic(), "meta-pubed");
    }

    #[tokio::test]
    async fn closed_inbox_surfaces_as_error() {
        let (link, remote) = PeerLink::pair();
        let mut rx = link.subscribe();
        // Both sender halves must go away for the inbox to close.
        drop(remote);
        drop(link);

        let result = next_matching(&mut rx, |_| true).await;
        assert!(matches!(result, Err(WireError::ChannelClosed)));
    }
}
