//! Blob store trait and in-memory implementation.
//!
//! The store is a suspending collaborator: implementations may back it
//! with disk or network I/O, so reads and writes are async even though
//! the in-memory edition never blocks.

use crate::blob::Blob;
use crate::hash::Hash;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by blob-store operations.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    NotFound(Hash),

    #[error("blob {hash} is not {expected}")]
    WrongKind { hash: Hash, expected: &'static str },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Content-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob by content address.
    async fn get(&self, hash: &Hash) -> Option<Blob>;

    /// Store a blob under its content address.
    ///
    /// Idempotent: storing the same content twice is a no-op.
    async fn put(&self, blob: Blob) -> Result<Hash>;

    /// Check whether a blob is present.
    async fn contains(&self, hash: &Hash) -> bool;
}

/// Convenience accessors shared by all stores.
#[async_trait]
pub trait BlobStoreExt: BlobStore {
    /// Fetch a blob that must exist.
    async fn get_required(&self, hash: &Hash) -> Result<Blob> {
        self.get(hash).await.ok_or(StoreError::NotFound(*hash))
    }

    /// Fetch a blob that must be a JSON value.
    async fn get_json(&self, hash: &Hash) -> Result<Value> {
        match self.get_required(hash).await? {
            Blob::Json(v) => Ok(v),
            Blob::Binary(_) => Err(StoreError::WrongKind {
                hash: *hash,
                expected: "a JSON value",
            }),
        }
    }

    /// Fetch a blob that must be binary.
    async fn get_binary(&self, hash: &Hash) -> Result<Vec<u8>> {
        match self.get_required(hash).await? {
            Blob::Binary(data) => Ok(data),
            Blob::Json(_) => Err(StoreError::WrongKind {
                hash: *hash,
                expected: "binary",
            }),
        }
    }
}

impl<S: BlobStore + ?Sized> BlobStoreExt for S {}

/// Shared handle to a blob store.
pub type SharedStore = Arc<dyn BlobStore>;

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<Hash, Blob>>,
}

impl MemoryBlobStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared handle to a fresh store.
    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, hash: &Hash) -> Option<Blob> {
        self.blobs.read().get(hash).cloned()
    }

    async fn put(&self, blob: Blob) -> Result<Hash> {
        let hash = blob.content_hash();
        self.blobs.write().entry(hash).or_insert(blob);
        Ok(hash)
    }

    async fn contains(&self, hash: &Hash) -> bool {
        self.blobs.read().contains_key(hash)
    }
}
