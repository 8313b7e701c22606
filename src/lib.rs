//! # ryw
//!
//! Read-your-writes routing for a primary database with asynchronous
//! read replicas:
//! - every committed write raises the writing session's required log
//!   position to the primary's position at commit
//! - every read goes to a replica that has applied at least that position,
//!   or to the primary when none has
//! - writes run in serializable transactions and retry on conflict
//!
//! ## Architecture
//!
//! ```text
//!            POST /rides                     GET /rides/:id
//!                 │                                │
//!        ┌────────▼─────────┐            ┌─────────▼────────┐
//!        │ WriteCoordinator │            │ ReplicaSelector  │
//!        └──┬────────────┬──┘            └──┬────────────┬──┘
//!   insert  │   advance  │        required  │   statuses │
//!        ┌──▼──────┐ ┌───▼─────────────┐    │   ┌────────▼──────────┐
//!        │ Primary │ │ PositionTracker ◄────┘   │ ReplicaStatusStore│
//!        └──┬──────┘ └─────────────────┘        └────────▲──────────┘
//!           │ replication stream                         │ applied
//!   ┌───────▼──────┬──────────────┐                      │ positions
//!   │ Replica A    │ Replica B    │ Replica C  ──────────┘
//!   └──────────────┴──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # In-memory cluster with three lagging replicas
//! API_PORT=8080 ryw-api
//!
//! # Postgres primary and streaming replicas
//! RYW_CONFIG=ryw.toml API_PORT=8080 ryw-api
//!
//! # Drive it
//! ryw-sim --port 8080 --iterations 100
//! ```

#![allow(clippy::result_large_err)]

pub mod api;
pub mod common;
pub mod router;
pub mod sim;
pub mod store;

// Re-export commonly used types
pub use api::ApiServer;
pub use common::{Config, Error, Lsn, Result};
pub use router::{ReplicaSelector, Target, WriteCoordinator};
pub use sim::Simulator;
pub use store::{MemoryCluster, PgCluster};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
