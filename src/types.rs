//! Core identifier and routing types shared across the engine.
//!
//! These are the domain concepts a workflow is built from: nodes are addressed
//! by [`NodeId`], runs by [`RunId`], and control flow is expressed through
//! [`Route`] values returned from node executions.
//!
//! # Examples
//!
//! ```rust
//! use treadle::types::{NodeId, Route};
//!
//! let id = NodeId::from("fetch");
//! assert_eq!(id.as_str(), "fetch");
//!
//! let route = Route::Many(vec!["a".into(), "b".into()]);
//! assert_eq!(route.encode(), "Many:a,b");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Addressable identifier of a node registered in a workflow topology.
///
/// `NodeId` is an opaque string key. The engine never interprets its content,
/// but it does feed the order-key hash, so identifiers must be stable across
/// processes and runs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Provenance sentinel used as the parent of seed work items.
    pub const ROOT: &'static str = "<root>";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The root pseudo-node that seeds a run's first work item.
    #[must_use]
    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a single engine run.
///
/// Run ids are chosen by the caller (any stable string works); [`RunId::fresh`]
/// mints a UUIDv4-backed id for callers that do not care.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a random run id.
    #[must_use]
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Step counter within a run. Step 0 is the initial checkpoint; committed
/// steps start at 1.
pub type StepId = u64;

/// Explicit routing decision returned by a node.
///
/// A node may also return no route at all (`NodeResult::route == None`), in
/// which case the topology's outgoing edges decide the successors. An explicit
/// route always overrides edge evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    /// Terminate this branch of the workflow.
    Stop,
    /// Continue with exactly one successor.
    Goto(NodeId),
    /// Fan out to several successors, in the given order.
    Many(Vec<NodeId>),
}

impl Route {
    /// Stable string form used in digests and divergence reports.
    ///
    /// - `Stop` → `"Stop"`
    /// - `Goto(n)` → `"Goto:n"`
    /// - `Many([a, b])` → `"Many:a,b"`
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Route::Stop => "Stop".to_string(),
            Route::Goto(n) => format!("Goto:{n}"),
            Route::Many(ns) => {
                let joined: Vec<&str> = ns.iter().map(NodeId::as_str).collect();
                format!("Many:{}", joined.join(","))
            }
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
