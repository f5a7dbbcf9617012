//! Branch value materialization.
//!
//! A branch value is the fold of every committed transaction along the
//! linearized history of the branch head, plus any staged transactions
//! on top. Committed transactions are loaded from the store by content
//! address; staged ones still carry their payloads inline.

use crate::cache::CommitValueCache;
use crate::error::{Result, StageError};
use crate::evaluator::SharedEvaluator;
use crate::value::CommitRecord;
use pvcs_meta::{history, CausalOrder, CommitId, CommitObject, RepoMeta, Transaction};
use pvcs_store::{blob_trans_id, Blob, BlobStore, BlobStoreExt, Hash, SharedStore};
use serde_json::{json, Value};

/// Load and decode a commit object.
async fn load_commit(store: &SharedStore, id: &CommitId) -> Result<CommitObject> {
    let value = store.get_json(id).await?;
    Ok(CommitObject::from_blob(*id, &Blob::json(value))?)
}

/// The blob-store transaction: persist the payload under its content
/// address and record the reference in the value's `"blobs"` list.
///
/// Deterministic in `(value, params)` — the recorded reference is the
/// payload's content hash.
async fn store_blob_trans(store: &SharedStore, val: Value, data: Vec<u8>) -> Result<Value> {
    let hash = store.put(Blob::binary(data)).await?;
    Ok(append_blob_ref(val, hash))
}

fn append_blob_ref(val: Value, hash: Hash) -> Value {
    let hex = Value::String(hash.to_hex());
    match val {
        Value::Object(mut map) => {
            match map.get_mut("blobs") {
                Some(Value::Array(blobs)) => blobs.push(hex),
                _ => {
                    map.insert("blobs".to_string(), Value::Array(vec![hex]));
                }
            }
            Value::Object(map)
        }
        // Non-object bases are replaced by a fresh record of references.
        _ => json!({ "blobs": [hex] }),
    }
}

/// Apply one committed transaction, referenced by content address.
async fn trans_apply_stored(
    store: &SharedStore,
    eval: &SharedEvaluator,
    val: Value,
    param_id: Hash,
    fn_id: Hash,
) -> Result<Value> {
    if fn_id == blob_trans_id() {
        let data = store.get_binary(&param_id).await?;
        return store_blob_trans(store, val, data).await;
    }

    let source = store.get_json(&fn_id).await?;
    let source = source.as_str().ok_or_else(|| {
        StageError::MalformedTransaction(format!(
            "function source {} is not a string",
            fn_id.short()
        ))
    })?;
    let f = eval
        .resolve(source)
        .ok_or_else(|| StageError::UnknownTransFn(source.to_string()))?;
    let params = store.get_json(&param_id).await?;
    Ok(f(val, params))
}

/// Apply one staged transaction, payload inline.
pub async fn trans_apply_staged(
    store: &SharedStore,
    eval: &SharedEvaluator,
    val: Value,
    tx: &Transaction,
) -> Result<Value> {
    if tx.is_blob() {
        let data = tx
            .params
            .as_binary()
            .ok_or_else(|| {
                StageError::MalformedTransaction(
                    "blob transaction without binary payload".to_string(),
                )
            })?
            .to_vec();
        return store_blob_trans(store, val, data).await;
    }

    let f = eval
        .resolve(&tx.trans_fn)
        .ok_or_else(|| StageError::UnknownTransFn(tx.trans_fn.clone()))?;
    let params = tx
        .params
        .as_json()
        .ok_or_else(|| {
            StageError::MalformedTransaction(
                "non-blob transaction with binary payload".to_string(),
            )
        })?
        .clone();
    Ok(f(val, params))
}

/// Materialize the repository value at a commit.
///
/// Folds transactions along the commit's linearized history, starting
/// from the empty value at the root. The walk is iterative over the
/// linearization, so history depth costs no stack, and it yields to the
/// scheduler at every commit boundary.
///
/// Values are memoized per commit. A commit's cache entry is only
/// written — and only reused — when the fold prefix behind it equals
/// the commit's own ancestor set, which keeps every entry a pure
/// function of its key even across materializations from different
/// heads of the same DAG.
pub async fn commit_value(
    store: &SharedStore,
    eval: &SharedEvaluator,
    cache: &CommitValueCache,
    causal: &CausalOrder,
    commit: CommitId,
) -> Result<Value> {
    let causal_id = causal.content_hash();
    if let Some(cached) = cache.get(eval.id(), &causal_id, &commit) {
        return Ok(cached);
    }

    let order = history(causal, commit);
    let mut val = Value::Null;
    let mut emitted = 0usize;
    let mut prev: Option<(CommitId, usize)> = None; // (commit, ancestor count)

    for c in order {
        let parents = causal.parents(&c);
        let ancestor_count = match (parents, prev) {
            ([], _) => 0,
            ([p], Some((prev_c, prev_count))) if *p == prev_c => prev_count + 1,
            _ => causal.ancestors(&c).len(),
        };
        // The fold prefix is canonical for `c` when everything emitted
        // so far is exactly `c`'s ancestry.
        let canonical = ancestor_count == emitted;

        if canonical {
            if let Some(cached) = cache.get(eval.id(), &causal_id, &c) {
                val = cached;
                emitted += 1;
                prev = Some((c, ancestor_count));
                continue;
            }
        }

        let commit_obj = load_commit(store, &c).await?;
        for (param_id, fn_id) in &commit_obj.transactions {
            val = trans_apply_stored(store, eval, val, *param_id, *fn_id).await?;
        }

        if canonical {
            cache.insert(eval.id(), &causal_id, &c, val.clone());
        }
        emitted += 1;
        prev = Some((c, ancestor_count));

        tokio::task::yield_now().await;
    }

    Ok(val)
}

/// Materialize a branch: the value at its unique head, with any staged
/// transactions folded on top.
///
/// Fails with the multiple-heads error when the branch has diverged;
/// conflicted branches are summarized, not materialized.
pub async fn branch_value(
    store: &SharedStore,
    eval: &SharedEvaluator,
    cache: &CommitValueCache,
    meta: &RepoMeta,
    branch: &str,
    staged: &[Transaction],
) -> Result<Value> {
    let head = meta.single_head(branch)?;
    let mut val = commit_value(store, eval, cache, &meta.causal, head).await?;
    for tx in staged {
        val = trans_apply_staged(store, eval, val, tx).await?;
    }
    Ok(val)
}

/// Load the linearized history of a head as materialized commit records.
pub async fn history_values(
    store: &SharedStore,
    causal: &CausalOrder,
    head: CommitId,
) -> Result<Vec<CommitRecord>> {
    let mut records = Vec::new();
    for id in history(causal, head) {
        let commit = load_commit(store, &id).await?;
        let mut transactions = Vec::new();
        for (param_id, fn_id) in &commit.transactions {
            let params = store
                .get(param_id)
                .await
                .ok_or(pvcs_store::StoreError::NotFound(*param_id))?;
            let trans_fn = if *fn_id == blob_trans_id() {
                pvcs_store::BLOB_TRANS_FN.to_string()
            } else {
                let source = store.get_json(fn_id).await?;
                source
                    .as_str()
                    .ok_or_else(|| {
                        StageError::MalformedTransaction(format!(
                            "function source {} is not a string",
                            fn_id.short()
                        ))
                    })?
                    .to_string()
            };
            transactions.push(Transaction { params, trans_fn });
        }
        records.push(CommitRecord {
            id,
            author: commit.author,
            branch: commit.branch,
            transactions,
        });
    }
    Ok(records)
}
