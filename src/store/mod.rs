//! Storage backends
//!
//! A backend owns the primary, its replicas and the account and ride
//! relations, and implements every contract the router consumes:
//! [`PositionTracker`], [`ReplicaStatusStore`], [`PrimaryStore`],
//! plus [`AccountStore`] and [`RideReader`] for the HTTP handlers.

pub mod memory;
pub mod postgres;

pub use memory::MemoryCluster;
pub use postgres::PgCluster;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::common::{Lsn, Result};
use crate::router::{PositionTracker, PrimaryStore, ReplicaStatusStore, Target};

pub type AccountId = i64;
pub type RideId = i64;

/// A user account; its `min_position` is the session's read bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    /// `None` until the first write
    pub min_position: Option<Lsn>,
}

/// Ride to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewRide {
    pub user_id: AccountId,
    pub distance: f64,
}

/// A stored ride
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ride {
    pub id: RideId,
    pub distance: f64,
    pub user_id: AccountId,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Resolve the value of an `Authorization` header to an account.
    async fn find_by_credential(&self, credential: &str) -> Result<Option<Account>>;

    /// Find or create the account for `email`.
    async fn ensure_account(&self, email: &str) -> Result<Account>;
}

#[async_trait]
pub trait RideReader: Send + Sync {
    /// Look a ride up on the given node.
    async fn find_ride(&self, target: &Target, id: RideId) -> Result<Option<Ride>>;
}

/// Every contract a backend provides
pub trait Cluster:
    AccountStore + PositionTracker + ReplicaStatusStore + PrimaryStore + RideReader
{
}

impl<T> Cluster for T where
    T: AccountStore + PositionTracker + ReplicaStatusStore + PrimaryStore + RideReader
{
}

/// Handles onto one backend, split by contract
#[derive(Clone)]
pub struct Backends {
    pub accounts: Arc<dyn AccountStore>,
    pub tracker: Arc<dyn PositionTracker>,
    pub status: Arc<dyn ReplicaStatusStore>,
    pub primary: Arc<dyn PrimaryStore>,
    pub reader: Arc<dyn RideReader>,
}

impl Backends {
    pub fn from_cluster<C: Cluster + 'static>(cluster: Arc<C>) -> Self {
        Self {
            accounts: cluster.clone(),
            tracker: cluster.clone(),
            status: cluster.clone(),
            primary: cluster.clone(),
            reader: cluster,
        }
    }
}
