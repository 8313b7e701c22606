//! Write coordinator
//!
//! Runs a write on the primary inside a serializable transaction, retrying
//! serialization failures with exponential backoff. Once the write commits
//! it reads the primary's current position and raises the session's bound
//! to it, so the session's next read only lands on a node that has the write.
//!
//! The advance runs on its own task: it completes even if the request that
//! triggered the write is dropped. A failed advance does not turn a committed
//! write into an error. It is logged as a consistency risk and reported in
//! [`WriteOutcome::bound`].

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::common::config::{AdvanceConfig, WriteConfig};
use crate::common::metrics::METRICS;
use crate::common::{Error, Lsn, Result};
use crate::router::PositionTracker;
use crate::store::{AccountId, NewRide, Ride};

/// Write side of the primary.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Insert a ride in one serializable transaction and commit it.
    async fn insert_ride(&self, ride: &NewRide) -> Result<Ride>;

    /// The primary's current log position.
    ///
    /// Queried after commit, so it is at or after every committed write.
    async fn current_position(&self) -> Result<Lsn>;
}

/// Retry policy for the write path
#[derive(Debug, Clone)]
pub struct WritePolicy {
    /// Serializable attempts before giving up
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Position advance attempts after commit
    pub advance_attempts: usize,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self::from_config(&WriteConfig::default(), &AdvanceConfig::default())
    }
}

impl WritePolicy {
    pub fn from_config(writes: &WriteConfig, advance: &AdvanceConfig) -> Self {
        Self {
            max_attempts: writes.max_attempts.max(1),
            initial_backoff: Duration::from_millis(writes.initial_backoff_ms),
            max_backoff: Duration::from_millis(writes.max_backoff_ms),
            advance_attempts: advance.max_attempts.max(1),
        }
    }

    /// No sleeping between attempts
    pub fn immediate(max_attempts: usize, advance_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            advance_attempts,
        }
    }

    /// Delay after the given failed attempt (1-indexed), doubling up to the cap.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_backoff)
    }
}

/// State of the session's read bound after a committed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyBound {
    /// Bound now at least this position
    Advanced(Lsn),
    /// Write is durable but the bound was not raised
    Stale { reason: String },
}

impl ConsistencyBound {
    pub fn is_advanced(&self) -> bool {
        matches!(self, ConsistencyBound::Advanced(_))
    }
}

/// A committed write
#[derive(Debug, Clone)]
pub struct WriteOutcome<T> {
    pub value: T,
    /// Serializable attempts used
    pub attempts: usize,
    pub bound: ConsistencyBound,
}

#[derive(Clone)]
pub struct WriteCoordinator {
    primary: Arc<dyn PrimaryStore>,
    tracker: Arc<dyn PositionTracker>,
    policy: WritePolicy,
}

impl WriteCoordinator {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        tracker: Arc<dyn PositionTracker>,
        policy: WritePolicy,
    ) -> Self {
        Self {
            primary,
            tracker,
            policy,
        }
    }

    pub fn policy(&self) -> &WritePolicy {
        &self.policy
    }

    /// Record a ride for `account`.
    pub async fn create_ride(&self, account: AccountId, distance: f64) -> Result<WriteOutcome<Ride>> {
        let ride = NewRide {
            user_id: account,
            distance,
        };
        let primary = self.primary.clone();
        self.execute(account, || {
            let primary = primary.clone();
            let ride = ride.clone();
            async move { primary.insert_ride(&ride).await }
        })
        .await
    }

    /// Run `write` (one serializable transaction per call) until it commits,
    /// then advance `account`'s position.
    pub async fn execute<T, F, Fut>(&self, account: AccountId, mut write: F) -> Result<WriteOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        let value = loop {
            attempts += 1;
            match write().await {
                Ok(value) => break value,
                Err(e) if e.is_serialization_failure() => {
                    METRICS.write_conflicts.inc();
                    if attempts >= self.policy.max_attempts {
                        METRICS.write_conflicts_exhausted.inc();
                        warn!(account, attempts, error = %e, "Write conflict retries exhausted");
                        return Err(Error::WriteConflict { attempts });
                    }
                    let delay = self.policy.delay_for_attempt(attempts);
                    warn!(
                        account,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Serializable write conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };
        METRICS.writes_committed.inc();

        let bound = self.spawn_advance(account).await;
        Ok(WriteOutcome {
            value,
            attempts,
            bound,
        })
    }

    async fn spawn_advance(&self, account: AccountId) -> ConsistencyBound {
        let primary = self.primary.clone();
        let tracker = self.tracker.clone();
        let policy = self.policy.clone();

        let task = tokio::spawn(advance(primary, tracker, policy, account));
        match task.await {
            Ok(bound) => bound,
            Err(e) => {
                METRICS.position_advance_failures.inc();
                error!(account, consistency_risk = true, error = %e, "Position advance task failed");
                ConsistencyBound::Stale {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Raise the session's bound to the primary's current position, retrying
/// transient failures. Never fails: the write is already durable.
async fn advance(
    primary: Arc<dyn PrimaryStore>,
    tracker: Arc<dyn PositionTracker>,
    policy: WritePolicy,
    account: AccountId,
) -> ConsistencyBound {
    let mut last_error = None;

    for attempt in 1..=policy.advance_attempts {
        let result = async {
            let position = primary.current_position().await?;
            tracker.advance_required_position(account, position).await
        }
        .await;

        match result {
            Ok(stored) => {
                METRICS.positions_advanced.inc();
                debug!(account, position = %stored, "Session position advanced");
                return ConsistencyBound::Advanced(stored);
            }
            Err(e @ Error::SessionNotFound(_)) => {
                last_error = Some(e);
                break;
            }
            Err(e) => {
                warn!(account, attempt, error = %e, "Position advance failed");
                last_error = Some(e);
                if attempt < policy.advance_attempts {
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                }
            }
        }
    }

    let failure = Error::PositionAdvance {
        account,
        reason: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string()),
    };
    METRICS.position_advance_failures.inc();
    error!(
        account,
        consistency_risk = true,
        error = %failure,
        "Write committed but session position was not advanced; reads may miss it"
    );
    ConsistencyBound::Stale {
        reason: failure.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePrimary {
        position: AtomicU64,
        next_id: AtomicU64,
        conflicts: AtomicUsize,
        broken: bool,
        position_failures: AtomicUsize,
        position_delay: Duration,
    }

    #[async_trait]
    impl PrimaryStore for FakePrimary {
        async fn insert_ride(&self, ride: &NewRide) -> Result<Ride> {
            if self.broken {
                return Err(Error::Internal("disk full".into()));
            }
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::SerializationFailure("could not serialize access".into()));
            }
            self.position.fetch_add(10, Ordering::SeqCst);
            Ok(Ride {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1,
                distance: ride.distance,
                user_id: ride.user_id,
            })
        }

        async fn current_position(&self) -> Result<Lsn> {
            if !self.position_delay.is_zero() {
                tokio::time::sleep(self.position_delay).await;
            }
            if self
                .position_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Timeout("pg_current_wal_lsn".into()));
            }
            Ok(Lsn::new(self.position.load(Ordering::SeqCst)))
        }
    }

    #[derive(Default)]
    struct RecordingTracker {
        bound: Mutex<Option<Lsn>>,
        missing: bool,
    }

    #[async_trait]
    impl PositionTracker for RecordingTracker {
        async fn required_position(&self, _account: AccountId) -> Result<Option<Lsn>> {
            Ok(*self.bound.lock().unwrap())
        }

        async fn advance_required_position(&self, account: AccountId, position: Lsn) -> Result<Lsn> {
            if self.missing {
                return Err(Error::SessionNotFound(account));
            }
            let mut bound = self.bound.lock().unwrap();
            let stored = bound.map_or(position, |b| b.max(position));
            *bound = Some(stored);
            Ok(stored)
        }
    }

    fn coordinator(
        primary: Arc<FakePrimary>,
        tracker: Arc<RecordingTracker>,
        policy: WritePolicy,
    ) -> WriteCoordinator {
        WriteCoordinator::new(primary, tracker, policy)
    }

    #[tokio::test]
    async fn test_write_advances_position_after_commit() {
        let primary = Arc::new(FakePrimary::default());
        let tracker = Arc::new(RecordingTracker::default());
        let coord = coordinator(primary.clone(), tracker.clone(), WritePolicy::immediate(3, 3));

        let outcome = coord.create_ride(1, 42.0).await.unwrap();
        assert_eq!(outcome.value.distance, 42.0);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.bound, ConsistencyBound::Advanced(Lsn::new(10)));
        assert_eq!(*tracker.bound.lock().unwrap(), Some(Lsn::new(10)));
    }

    #[tokio::test]
    async fn test_serialization_failures_are_retried() {
        let primary = Arc::new(FakePrimary {
            conflicts: AtomicUsize::new(2),
            ..Default::default()
        });
        let tracker = Arc::new(RecordingTracker::default());
        let coord = coordinator(primary, tracker, WritePolicy::immediate(3, 1));

        let outcome = coord.create_ride(1, 5.5).await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.bound.is_advanced());
    }

    #[tokio::test]
    async fn test_conflict_retries_exhausted() {
        let primary = Arc::new(FakePrimary {
            conflicts: AtomicUsize::new(10),
            ..Default::default()
        });
        let tracker = Arc::new(RecordingTracker::default());
        let coord = coordinator(primary.clone(), tracker.clone(), WritePolicy::immediate(3, 1));

        let err = coord.create_ride(1, 5.5).await.unwrap_err();
        assert!(matches!(err, Error::WriteConflict { attempts: 3 }));
        // Nothing committed, nothing advanced
        assert_eq!(primary.position.load(Ordering::SeqCst), 0);
        assert_eq!(*tracker.bound.lock().unwrap(), None);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let primary = Arc::new(FakePrimary {
            broken: true,
            ..Default::default()
        });
        let coord = coordinator(
            primary,
            Arc::new(RecordingTracker::default()),
            WritePolicy::immediate(5, 1),
        );

        let err = coord.create_ride(1, 5.5).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_advance_retries_transient_failures() {
        let primary = Arc::new(FakePrimary {
            position_failures: AtomicUsize::new(1),
            ..Default::default()
        });
        let tracker = Arc::new(RecordingTracker::default());
        let coord = coordinator(primary, tracker, WritePolicy::immediate(1, 2));

        let outcome = coord.create_ride(1, 9.0).await.unwrap();
        assert_eq!(outcome.bound, ConsistencyBound::Advanced(Lsn::new(10)));
    }

    #[tokio::test]
    async fn test_advance_failure_keeps_committed_write() {
        let primary = Arc::new(FakePrimary {
            position_failures: AtomicUsize::new(5),
            ..Default::default()
        });
        let tracker = Arc::new(RecordingTracker::default());
        let coord = coordinator(primary, tracker.clone(), WritePolicy::immediate(1, 2));

        let outcome = coord.create_ride(1, 9.0).await.unwrap();
        assert_eq!(outcome.value.id, 1);
        match outcome.bound {
            ConsistencyBound::Stale { reason } => assert!(reason.contains("account 1")),
            other => panic!("expected stale bound, got {:?}", other),
        }
        assert_eq!(*tracker.bound.lock().unwrap(), None);
    }

    #[tokio::test]
    async fn test_advance_survives_dropped_request() {
        let primary = Arc::new(FakePrimary {
            position_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let tracker = Arc::new(RecordingTracker::default());
        let coord = coordinator(primary.clone(), tracker.clone(), WritePolicy::immediate(1, 1));

        // The insert commits at once; the caller gives up while the advance waits
        let dropped = tokio::time::timeout(Duration::from_millis(20), coord.create_ride(1, 3.0)).await;
        assert!(dropped.is_err());
        assert_eq!(primary.position.load(Ordering::SeqCst), 10);
        assert_eq!(*tracker.bound.lock().unwrap(), None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*tracker.bound.lock().unwrap(), Some(Lsn::new(10)));
    }

    #[tokio::test]
    async fn test_missing_session_is_not_retried() {
        let primary = Arc::new(FakePrimary::default());
        let tracker = Arc::new(RecordingTracker {
            missing: true,
            ..Default::default()
        });
        let coord = coordinator(primary, tracker, WritePolicy::immediate(1, 5));

        let outcome = coord.create_ride(3, 1.0).await.unwrap();
        assert!(!outcome.bound.is_advanced());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = WritePolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            advance_attempts: 1,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_millis(50));
    }
}
