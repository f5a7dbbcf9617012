//! # pvcs-wire
//!
//! Peer wire protocol for the pvcs substrate.
//!
//! This crate provides:
//! - The topic-tagged [`Message`] set gossiped between stages and peers
//! - [`PeerLink`] — a stage's outbound/inbound channel pair
//! - [`LocalPeer`] — an in-process peer fabric with subscription
//!   filters, blob fetching, acknowledgements and echo suppression
//!
//! Publications carry metadata only; the blobs behind them are pulled
//! separately over `fetch` / `binary-fetch`, which keeps gossip cheap
//! and lets content addressing deduplicate transfers.

mod link;
mod message;
mod peer;

pub use link::{next_matching, PeerLink, RemoteEnd, Result, WireError};
pub use message::{covers, filter_metas, Message, MetaMap, SubSpec};
pub use peer::LocalPeer;
