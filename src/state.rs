//! Workflow state requirements and a ready-made JSON state.
//!
//! The engine is generic over the state type `S`. Anything that satisfies
//! [`WorkflowState`] works: cloneable (parallel siblings receive independent
//! deep copies), serde-serializable (checkpoints persist the state in a
//! self-describing form), and thread-safe. Equality is defined by the run's
//! reducer, not structurally.
//!
//! For tests, demos, and applications that do not want a bespoke state type,
//! [`JsonState`] wraps a JSON object with sorted keys — serialization is
//! canonical, so byte-identical-replay assertions hold without extra work —
//! and [`merge_json`] provides a shallow last-writer-wins merge reducer over
//! it.
//!
//! # Examples
//!
//! ```rust
//! use treadle::state::{merge_json, JsonState};
//! use treadle::reducer::Reducer;
//! use serde_json::json;
//!
//! let base = JsonState::new().with("count", json!(1));
//! let delta = JsonState::new().with("count", json!(2)).with("tag", json!("x"));
//! let merged = merge_json.apply(base, delta);
//! assert_eq!(merged.get("count"), Some(&json!(2)));
//! assert_eq!(merged.get("tag"), Some(&json!("x")));
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;

/// Bounds every workflow state type must satisfy.
///
/// Blanket-implemented; never implement it by hand.
pub trait WorkflowState:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<S> WorkflowState for S where S: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// General-purpose JSON-object state with canonical (sorted-key) layout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonState {
    entries: BTreeMap<String, Value>,
}

impl JsonState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Integer accessor for counter-style fields; absent or non-numeric reads
    /// as 0.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> i64 {
        self.entries.get(key).and_then(Value::as_i64).unwrap_or(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }
}

/// Shallow merge reducer for [`JsonState`]: delta entries overwrite
/// accumulator entries key by key. Pure and total; last writer wins within a
/// single application, and merge order across siblings is the scheduler's
/// canonical order-key order.
pub fn merge_json(mut acc: JsonState, delta: JsonState) -> JsonState {
    for (key, value) in delta.entries {
        acc.entries.insert(key, value);
    }
    acc
}
