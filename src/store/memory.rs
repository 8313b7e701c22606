//! In-process primary with asynchronously replicated read replicas
//!
//! Every committed ride gets the next log position and is appended to a
//! replication log. Replicas apply that log on their own schedule, either
//! driven explicitly (`replicate`, `replicate_all`) or by the background
//! stream started with [`MemoryCluster::spawn_replication`], which applies
//! changes once they are older than a fixed lag. Each apply refreshes the
//! replica's status row.
//!
//! Fault hooks let tests and chaos runs inject serialization conflicts,
//! position-advance failures and status-store outages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::common::{Config, Error, Lsn, Result};
use crate::router::{PositionTracker, PrimaryStore, ReplicaId, ReplicaStatus, ReplicaStatusStore, Target};
use crate::store::{Account, AccountId, AccountStore, NewRide, Ride, RideId, RideReader};

struct LogRecord {
    lsn: Lsn,
    committed_at: Instant,
    ride: Ride,
}

struct ReplicaState {
    applied: Lsn,
    observed_at: DateTime<Utc>,
    rides: BTreeMap<RideId, Ride>,
}

#[derive(Default)]
struct ClusterState {
    position: Lsn,
    next_ride_id: RideId,
    next_account_id: AccountId,
    accounts: BTreeMap<AccountId, Account>,
    by_email: HashMap<String, AccountId>,
    rides: BTreeMap<RideId, Ride>,
    log: VecDeque<LogRecord>,
    replicas: BTreeMap<ReplicaId, ReplicaState>,
}

impl ClusterState {
    /// Apply log records up to `up_to` on one replica.
    fn apply(&mut self, replica: &ReplicaId, up_to: Lsn) -> Result<Lsn> {
        let target = up_to.min(self.position);
        let state = self
            .replicas
            .get_mut(replica)
            .ok_or_else(|| Error::UnknownReplica(replica.to_string()))?;

        let from = state.applied;
        if target > from {
            for record in self.log.iter().filter(|r| r.lsn > from && r.lsn <= target) {
                state.rides.insert(record.ride.id, record.ride.clone());
            }
            state.applied = target;
        }
        state.observed_at = Utc::now();
        let applied = state.applied;

        self.trim_log();
        Ok(applied)
    }

    /// Drop records every replica has applied.
    fn trim_log(&mut self) {
        let Some(floor) = self.replicas.values().map(|r| r.applied).min() else {
            self.log.clear();
            return;
        };
        while self.log.front().is_some_and(|r| r.lsn <= floor) {
            self.log.pop_front();
        }
    }

    /// Newest position whose change has been committed for at least `lag`.
    fn settled_position(&self, lag: Duration) -> Lsn {
        match self.log.iter().find(|r| r.committed_at.elapsed() < lag) {
            Some(young) => Lsn::new(young.lsn.as_u64().saturating_sub(1)),
            None => self.position,
        }
    }
}

#[derive(Default)]
struct Faults {
    write_conflicts: AtomicUsize,
    advance_failures: AtomicUsize,
    status_unavailable: AtomicBool,
    status_delay_ms: AtomicU64,
}

/// Take one injected fault, if any are left.
fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct MemoryCluster {
    state: Mutex<ClusterState>,
    faults: Faults,
}

impl MemoryCluster {
    pub fn new(replicas: impl IntoIterator<Item = ReplicaId>) -> Self {
        let now = Utc::now();
        let replicas = replicas
            .into_iter()
            .map(|id| {
                (
                    id,
                    ReplicaState {
                        applied: Lsn::ZERO,
                        observed_at: now,
                        rides: BTreeMap::new(),
                    },
                )
            })
            .collect();

        Self {
            state: Mutex::new(ClusterState {
                next_ride_id: 1,
                next_account_id: 1,
                replicas,
                ..Default::default()
            }),
            faults: Faults::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.replicas.iter().map(|r| ReplicaId::new(r.id.clone())))
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The primary's latest committed position
    pub fn primary_position(&self) -> Lsn {
        self.state().position
    }

    /// How far `replica` has applied the log
    pub fn replica_position(&self, replica: &ReplicaId) -> Option<Lsn> {
        self.state().replicas.get(replica).map(|r| r.applied)
    }

    /// Apply the log on `replica` up to `up_to` (capped at the primary).
    pub fn replicate(&self, replica: &ReplicaId, up_to: Lsn) -> Result<Lsn> {
        self.state().apply(replica, up_to)
    }

    /// Bring every replica level with the primary.
    pub fn replicate_all(&self) {
        let mut state = self.state();
        let position = state.position;
        let ids: Vec<ReplicaId> = state.replicas.keys().cloned().collect();
        for id in ids {
            let _ = state.apply(&id, position);
        }
    }

    /// Apply every change committed at least `lag` ago on every replica.
    pub fn replicate_older_than(&self, lag: Duration) {
        let mut state = self.state();
        let settled = state.settled_position(lag);
        let ids: Vec<ReplicaId> = state.replicas.keys().cloned().collect();
        for id in ids {
            let _ = state.apply(&id, settled);
        }
    }

    /// Run the replication stream in the background.
    pub fn spawn_replication(self: &Arc<Self>, lag: Duration, tick: Duration) -> JoinHandle<()> {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick.max(Duration::from_millis(1)));
            loop {
                interval.tick().await;
                cluster.replicate_older_than(lag);
                trace!(primary = %cluster.primary_position(), "Replication tick");
            }
        })
    }

    // === Fault injection ===

    /// Abort the next `n` ride inserts with a serialization failure.
    pub fn inject_write_conflicts(&self, n: usize) {
        self.faults.write_conflicts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` position advances.
    pub fn inject_advance_failures(&self, n: usize) {
        self.faults.advance_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_status_unavailable(&self, unavailable: bool) {
        self.faults
            .status_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// Delay every status read by `delay`.
    pub fn set_status_delay(&self, delay: Duration) {
        self.faults
            .status_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountStore for MemoryCluster {
    async fn find_by_credential(&self, credential: &str) -> Result<Option<Account>> {
        let state = self.state();
        Ok(state
            .by_email
            .get(credential)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn ensure_account(&self, email: &str) -> Result<Account> {
        let mut state = self.state();
        if let Some(account) = state.by_email.get(email).and_then(|id| state.accounts.get(id)) {
            return Ok(account.clone());
        }

        let id = state.next_account_id;
        state.next_account_id += 1;
        let account = Account {
            id,
            email: email.to_string(),
            min_position: None,
        };
        state.by_email.insert(email.to_string(), id);
        state.accounts.insert(id, account.clone());
        debug!(account = id, email, "Account created");
        Ok(account)
    }
}

#[async_trait]
impl PositionTracker for MemoryCluster {
    async fn required_position(&self, account: AccountId) -> Result<Option<Lsn>> {
        self.state()
            .accounts
            .get(&account)
            .map(|a| a.min_position)
            .ok_or(Error::SessionNotFound(account))
    }

    async fn advance_required_position(&self, account: AccountId, position: Lsn) -> Result<Lsn> {
        if take(&self.faults.advance_failures) {
            return Err(Error::Internal("injected position advance failure".into()));
        }

        let mut state = self.state();
        let account = state
            .accounts
            .get_mut(&account)
            .ok_or(Error::SessionNotFound(account))?;
        let stored = account.min_position.map_or(position, |p| p.max(position));
        account.min_position = Some(stored);
        Ok(stored)
    }
}

#[async_trait]
impl ReplicaStatusStore for MemoryCluster {
    async fn replica_statuses(&self, candidates: &[ReplicaId]) -> Result<Vec<ReplicaStatus>> {
        let delay = self.faults.status_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.faults.status_unavailable.load(Ordering::SeqCst) {
            return Err(Error::ReplicaStoreUnavailable("status table unreachable".into()));
        }

        let state = self.state();
        Ok(candidates
            .iter()
            .filter_map(|id| {
                state.replicas.get(id).map(|r| ReplicaStatus {
                    replica_id: id.clone(),
                    last_applied: r.applied,
                    observed_at: r.observed_at,
                })
            })
            .collect())
    }
}

#[async_trait]
impl PrimaryStore for MemoryCluster {
    async fn insert_ride(&self, ride: &NewRide) -> Result<Ride> {
        if take(&self.faults.write_conflicts) {
            return Err(Error::SerializationFailure(
                "could not serialize access due to read/write dependencies among transactions"
                    .into(),
            ));
        }

        let mut state = self.state();
        if !state.accounts.contains_key(&ride.user_id) {
            return Err(Error::SessionNotFound(ride.user_id));
        }

        let id = state.next_ride_id;
        state.next_ride_id += 1;
        let stored = Ride {
            id,
            distance: ride.distance,
            user_id: ride.user_id,
        };

        state.position = state.position.advance(1);
        let lsn = state.position;
        state.rides.insert(id, stored.clone());
        state.log.push_back(LogRecord {
            lsn,
            committed_at: Instant::now(),
            ride: stored.clone(),
        });
        Ok(stored)
    }

    async fn current_position(&self) -> Result<Lsn> {
        Ok(self.state().position)
    }
}

#[async_trait]
impl RideReader for MemoryCluster {
    async fn find_ride(&self, target: &Target, id: RideId) -> Result<Option<Ride>> {
        let state = self.state();
        let rides = match target {
            Target::Primary => &state.rides,
            Target::Replica(replica) => {
                &state
                    .replicas
                    .get(replica)
                    .ok_or_else(|| Error::UnknownReplica(replica.to_string()))?
                    .rides
            }
        };
        Ok(rides.get(&id).cloned())
    }
}
