//! Notifications delivered to the owning UI component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a UI-side node interested in a watched path.
///
/// The watcher never interprets this value; it only routes it back to the
/// owner when the associated directory may have changed. Multiple nodes may
/// depend on the same path, but a node watches at most one path at a time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A notification posted to the owner's channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// The directory a node depends on may have changed; the owner should
    /// take a fresh snapshot and re-validate the node.
    Changed {
        /// The dependent node to re-validate.
        node: NodeId,
        /// When the change was detected.
        timestamp: DateTime<Utc>,
    },

    /// End-of-batch marker: a delivery cycle with activity has settled and
    /// no more notifications follow until the next cycle. Useful to re-sort
    /// a view once after a burst of per-node updates.
    BatchSettled {
        /// When the batch settled.
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    /// Create a change notification for `node`, stamped now.
    pub fn changed(node: NodeId) -> Self {
        Self::Changed {
            node,
            timestamp: Utc::now(),
        }
    }

    /// Create a batch-settled marker, stamped now.
    pub fn settled() -> Self {
        Self::BatchSettled {
            timestamp: Utc::now(),
        }
    }

    /// The node this notification refers to, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::Changed { node, .. } => Some(*node),
            Self::BatchSettled { .. } => None,
        }
    }
}
