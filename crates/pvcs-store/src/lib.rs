//! # pvcs-store
//!
//! Content-addressed blob storage for the pvcs substrate.
//!
//! This crate provides:
//! - SHA-256 content addressing ([`Hash`], [`Hasher`])
//! - The blob payload model ([`Blob`]): JSON values and binary payloads
//! - The suspending [`BlobStore`] contract with an in-memory edition
//! - The well-known blob-transaction marker ([`blob_trans_id`])
//!
//! Content addressing makes storage idempotent and globally valid: the
//! same bytes always live under the same address, on every peer.

mod blob;
mod hash;
mod store;

pub use blob::{blob_trans_id, Blob, BLOB_TRANS_FN};
pub use hash::{Hash, Hasher};
pub use store::{BlobStore, BlobStoreExt, MemoryBlobStore, Result, SharedStore, StoreError};
