//! Blob payload model.
//!
//! Everything the substrate stores is a blob: commit objects, transaction
//! parameters and transaction-function sources travel as JSON values;
//! opaque payloads staged through binary transactions travel as raw bytes.

use crate::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Symbolic source form of the built-in blob-store transaction function.
///
/// A staged transaction whose function source equals this marker is routed
/// to the blob-store path by the materializer instead of the evaluator.
pub const BLOB_TRANS_FN: &str = "store-blob";

/// Well-known content address of the blob-store transaction function.
pub fn blob_trans_id() -> Hash {
    Hash::digest(BLOB_TRANS_FN.as_bytes())
}

/// A stored payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Blob {
    /// A JSON value: commit object, transaction parameters, or a
    /// transaction-function source.
    Json(Value),

    /// An opaque binary payload staged via a binary transaction.
    Binary(Vec<u8>),
}

impl Blob {
    /// Wrap a JSON value.
    pub fn json(value: Value) -> Self {
        Blob::Json(value)
    }

    /// Wrap raw bytes.
    pub fn binary(data: Vec<u8>) -> Self {
        Blob::Binary(data)
    }

    /// Check if this is a binary payload.
    pub fn is_binary(&self) -> bool {
        matches!(self, Blob::Binary(_))
    }

    /// View as a JSON value, if it is one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Blob::Json(v) => Some(v),
            Blob::Binary(_) => None,
        }
    }

    /// View as bytes, if binary.
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Blob::Json(_) => None,
            Blob::Binary(data) => Some(data),
        }
    }

    /// Type tag fed to the hasher so JSON and binary payloads with
    /// identical byte forms cannot collide.
    fn type_byte(&self) -> u8 {
        match self {
            Blob::Json(_) => 0,
            Blob::Binary(_) => 1,
        }
    }

    /// Compute the content address of this blob.
    ///
    /// JSON values are hashed over their serialized form; `serde_json`
    /// maps iterate in key order, so the byte form is canonical.
    pub fn content_hash(&self) -> Hash {
        let mut hasher = Hasher::new();
        hasher.field(&[self.type_byte()]);
        match self {
            Blob::Json(v) => {
                let bytes = serde_json::to_vec(v).expect("JSON value serializes");
                hasher.field(&bytes);
            }
            Blob::Binary(data) => {
                hasher.field(data);
            }
        }
        hasher.finish()
    }
}

impl From<Value> for Blob {
    fn from(value: Value) -> Self {
        Blob::Json(value)
    }
}

impl From<Vec<u8>> for Blob {
    fn from(data: Vec<u8>) -> Self {
        Blob::Binary(data)
    }
}
