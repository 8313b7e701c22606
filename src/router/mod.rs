//! Replica consistency router
//!
//! Decides, for each read, which physical node can serve it without
//! returning data older than the reader's own last write:
//! - `tracker`: per-session minimum position (raised after every write)
//! - `status`: read-only view of how far each replica has applied the log
//! - `selector`: picks the primary or one caught-up replica
//! - `coordinator`: runs writes on the primary and advances the session bound

pub mod coordinator;
pub mod selector;
pub mod status;
pub mod tracker;

pub use coordinator::{ConsistencyBound, PrimaryStore, WriteCoordinator, WriteOutcome, WritePolicy};
pub use selector::{FirstCandidate, RandomCandidate, ReplicaSelector, SelectionStrategy};
pub use status::{ReplicaStatus, ReplicaStatusStore};
pub use tracker::PositionTracker;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a configured read replica.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Where a read is executed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Primary,
    Replica(ReplicaId),
}

impl Target {
    pub fn is_primary(&self) -> bool {
        matches!(self, Target::Primary)
    }

    pub fn replica(&self) -> Option<&ReplicaId> {
        match self {
            Target::Primary => None,
            Target::Replica(id) => Some(id),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Primary => f.write_str(crate::common::config::PRIMARY_NAME),
            Target::Replica(id) => write!(f, "replica:{}", id),
        }
    }
}
