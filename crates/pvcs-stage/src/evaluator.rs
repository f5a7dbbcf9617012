//! The application-supplied transaction-function evaluator.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A concrete transaction function: `(value, params) → value`.
pub type TransFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// Maps transaction-function sources to concrete functions.
///
/// Resolution must be deterministic: the same source always yields the
/// same function, and the function itself must be pure — branch values
/// are replayed from committed history on every peer, and divergent
/// evaluators would silently fork the value space.
pub trait Evaluator: Send + Sync {
    /// Stable identity of this evaluator, used in commit-value cache
    /// keys. Different evaluators yield different values for the same
    /// commit, so the identity must change whenever resolution does.
    fn id(&self) -> &str;

    /// Resolve a transaction-function source to a function.
    fn resolve(&self, trans_fn: &str) -> Option<TransFn>;
}

/// Shared handle to an evaluator.
pub type SharedEvaluator = Arc<dyn Evaluator>;

/// Evaluator over a registered name map.
pub struct MapEvaluator {
    id: String,
    fns: HashMap<String, TransFn>,
}

impl MapEvaluator {
    /// Create an empty evaluator with the given identity.
    pub fn new(id: impl Into<String>) -> Self {
        MapEvaluator {
            id: id.into(),
            fns: HashMap::new(),
        }
    }

    /// Create an evaluator with the two functions the substrate's own
    /// flows rely on: `"init"` (replace the value with the parameters)
    /// and `"merge"` (shallow object union, parameters winning).
    pub fn with_defaults(id: impl Into<String>) -> Self {
        Self::new(id)
            .with_fn("init", |_, params| params)
            .with_fn("merge", |val, params| match (val, params) {
                (Value::Object(mut base), Value::Object(overlay)) => {
                    for (k, v) in overlay {
                        base.insert(k, v);
                    }
                    Value::Object(base)
                }
                (_, params) => params,
            })
    }

    /// Register a function under a source name.
    pub fn with_fn(
        mut self,
        name: impl Into<String>,
        f: impl Fn(Value, Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.fns.insert(name.into(), Arc::new(f));
        self
    }

    /// Wrap into a shared handle.
    pub fn shared(self) -> SharedEvaluator {
        Arc::new(self)
    }
}

impl Evaluator for MapEvaluator {
    fn id(&self) -> &str {
        &self.id
    }

    fn resolve(&self, trans_fn: &str) -> Option<TransFn> {
        self.fns.get(trans_fn).cloned()
    }
}
