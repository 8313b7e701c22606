//! Replica status store (consumer side)
//!
//! The replication subsystem keeps a table of `(replica, applied position,
//! observed_at)` rows up to date. The router only reads it, and treats any
//! replica without a row as not caught up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::common::{Lsn, Result};
use crate::router::ReplicaId;

/// One row of the status table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    pub replica_id: ReplicaId,
    pub last_applied: Lsn,
    pub observed_at: DateTime<Utc>,
}

#[async_trait]
pub trait ReplicaStatusStore: Send + Sync {
    /// Full status rows for the given replicas; unknown replicas are omitted.
    async fn replica_statuses(&self, candidates: &[ReplicaId]) -> Result<Vec<ReplicaStatus>>;

    /// Best-known applied position per candidate.
    ///
    /// A point read of whatever is recorded right now. It never waits on
    /// replication, so the answer may already be slightly stale.
    async fn list_replica_positions(
        &self,
        candidates: &[ReplicaId],
    ) -> Result<HashMap<ReplicaId, Lsn>> {
        Ok(self
            .replica_statuses(candidates)
            .await?
            .into_iter()
            .map(|s| (s.replica_id, s.last_applied))
            .collect())
    }
}
