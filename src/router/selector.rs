//! Replica selector
//!
//! For a session with a required position `P`, any replica whose applied
//! position is at or after `P` is a safe place to read. The selector:
//! 1. returns the primary if the session has never written,
//! 2. otherwise reads the status snapshot for the configured replicas,
//! 3. keeps those at or after `P`,
//! 4. picks one of them through the injected [`SelectionStrategy`],
//! 5. and returns the primary whenever no replica qualifies.
//!
//! Failures along the way (tracker error, status store error or timeout)
//! also route to the primary. Selection never fails a read.

use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::common::metrics::{FallbackReason, METRICS};
use crate::common::Lsn;
use crate::router::{PositionTracker, ReplicaId, ReplicaStatusStore, Target};
use crate::store::AccountId;

/// Default deadline for the status-store read
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_millis(250);

/// Chooses one replica out of a non-empty set of equally safe candidates.
pub trait SelectionStrategy: Send + Sync {
    fn choose(&self, candidates: &[ReplicaId]) -> Option<ReplicaId>;
}

/// Uniform random choice, to spread read load.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCandidate;

impl SelectionStrategy for RandomCandidate {
    fn choose(&self, candidates: &[ReplicaId]) -> Option<ReplicaId> {
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}

/// First candidate in configured replica order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstCandidate;

impl SelectionStrategy for FirstCandidate {
    fn choose(&self, candidates: &[ReplicaId]) -> Option<ReplicaId> {
        candidates.first().cloned()
    }
}

/// Outcome of one routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: Target,
    /// Set when the primary was chosen
    pub fallback: Option<FallbackReason>,
}

impl Route {
    fn primary(reason: FallbackReason) -> Self {
        Self {
            target: Target::Primary,
            fallback: Some(reason),
        }
    }
}

pub struct ReplicaSelector {
    tracker: Arc<dyn PositionTracker>,
    status: Arc<dyn ReplicaStatusStore>,
    replicas: Vec<ReplicaId>,
    strategy: Arc<dyn SelectionStrategy>,
    status_timeout: Duration,
}

impl ReplicaSelector {
    pub fn new(
        tracker: Arc<dyn PositionTracker>,
        status: Arc<dyn ReplicaStatusStore>,
        replicas: Vec<ReplicaId>,
    ) -> Self {
        Self {
            tracker,
            status,
            replicas,
            strategy: Arc::new(RandomCandidate),
            status_timeout: DEFAULT_STATUS_TIMEOUT,
        }
    }

    pub fn with_strategy(mut self, strategy: impl SelectionStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Configured replica set, in configuration order
    pub fn replicas(&self) -> &[ReplicaId] {
        &self.replicas
    }

    /// Pick the node to execute `account`'s next read on.
    pub async fn select_target(&self, account: AccountId) -> Target {
        let route = self.route(account).await;
        match route.fallback {
            Some(reason) => METRICS.record_primary_read(reason),
            None => METRICS.reads_replica.inc(),
        }
        route.target
    }

    /// Routing decision with the reason for a primary fallback.
    pub async fn route(&self, account: AccountId) -> Route {
        let required = match self.tracker.required_position(account).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                debug!(account, target = "primary", "Session has no writes");
                return Route::primary(FallbackReason::NoWrites);
            }
            Err(e) => {
                warn!(account, error = %e, "Position lookup failed, routing to primary");
                return Route::primary(FallbackReason::TrackerUnavailable);
            }
        };

        let lookup = self.status.list_replica_positions(&self.replicas);
        let positions = match tokio::time::timeout(self.status_timeout, lookup).await {
            Ok(Ok(positions)) => positions,
            Ok(Err(e)) => {
                warn!(account, error = %e, "Replica status unavailable, routing to primary");
                return Route::primary(FallbackReason::StatusUnavailable);
            }
            Err(_) => {
                warn!(
                    account,
                    timeout_ms = self.status_timeout.as_millis() as u64,
                    "Replica status lookup timed out, routing to primary"
                );
                return Route::primary(FallbackReason::StatusTimeout);
            }
        };

        let candidates = caught_up(&self.replicas, &positions, required);
        match self.strategy.choose(&candidates) {
            Some(replica) => {
                debug!(
                    account,
                    %required,
                    candidates = candidates.len(),
                    target = %replica,
                    "Routing read to replica"
                );
                Route {
                    target: Target::Replica(replica),
                    fallback: None,
                }
            }
            None => {
                debug!(account, %required, "No replica caught up, routing to primary");
                Route::primary(FallbackReason::NoCandidates)
            }
        }
    }
}

/// Configured replicas whose known position is at or after `required`.
///
/// Order follows `replicas`. Entries in `positions` for replicas outside the
/// configured set are ignored.
pub fn caught_up(
    replicas: &[ReplicaId],
    positions: &HashMap<ReplicaId, Lsn>,
    required: Lsn,
) -> Vec<ReplicaId> {
    replicas
        .iter()
        .filter(|id| {
            positions
                .get(*id)
                .is_some_and(|applied| applied.is_caught_up_to(required))
        })
        .cloned()
        .collect()
}
