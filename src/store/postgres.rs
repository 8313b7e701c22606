//! Postgres primary with streaming replicas
//!
//! Positions are WAL LSNs (`pg_lsn`). The primary holds the `users`,
//! `rides` and `replica_statuses` tables; replicas receive them through
//! streaming replication and are only ever read from.
//!
//! `replica_statuses` is kept fresh by [`PgCluster::refresh_statuses`],
//! which asks each replica for its replay position and records it on the
//! primary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::{Config, Error, Lsn, Result};
use crate::router::{PositionTracker, PrimaryStore, ReplicaId, ReplicaStatus, ReplicaStatusStore, Target};
use crate::store::{Account, AccountId, AccountStore, NewRide, Ride, RideId, RideReader};

const MAX_CONNECTIONS: u32 = 10;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    min_lsn PG_LSN
);

CREATE TABLE IF NOT EXISTS rides (
    id BIGSERIAL PRIMARY KEY,
    distance DOUBLE PRECISION NOT NULL,
    user_id BIGINT NOT NULL REFERENCES users (id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS replica_statuses (
    name TEXT PRIMARY KEY,
    last_lsn PG_LSN NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

type AccountRow = (i64, String, Option<String>);
type RideRow = (i64, f64, i64);

fn parse_lsn(text: &str) -> Result<Lsn> {
    text.parse()
}

fn account_from_row((id, email, min_lsn): AccountRow) -> Result<Account> {
    Ok(Account {
        id,
        email,
        min_position: min_lsn.as_deref().map(parse_lsn).transpose()?,
    })
}

fn ride_from_row((id, distance, user_id): RideRow) -> Ride {
    Ride {
        id,
        distance,
        user_id,
    }
}

#[derive(Clone)]
pub struct PgCluster {
    primary: PgPool,
    replicas: HashMap<ReplicaId, PgPool>,
}

impl PgCluster {
    pub fn new(primary: PgPool, replicas: HashMap<ReplicaId, PgPool>) -> Self {
        Self { primary, replicas }
    }

    /// Connect to the primary and open lazy pools for every replica.
    pub async fn connect(config: &Config) -> Result<Self> {
        let primary_url = config
            .primary_url
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("postgres backend needs primary_url".into()))?;

        let primary = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(primary_url)
            .await?;

        let mut replicas = HashMap::new();
        for replica in &config.replicas {
            let url = replica.url.as_deref().ok_or_else(|| {
                Error::InvalidConfig(format!("replica '{}' has no url", replica.id))
            })?;
            let pool = PgPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .connect_lazy(url)?;
            replicas.insert(ReplicaId::new(replica.id.clone()), pool);
        }

        info!(replicas = replicas.len(), "Connected to postgres");
        Ok(Self::new(primary, replicas))
    }

    pub async fn install_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.primary).await?;
        Ok(())
    }

    /// Record each replica's replay position in `replica_statuses`.
    ///
    /// Unreachable replicas keep their previous row. Returns how many rows
    /// were written.
    pub async fn refresh_statuses(&self) -> usize {
        let mut replayed = Vec::with_capacity(self.replicas.len());
        for (id, pool) in &self.replicas {
            let lsn: Option<String> =
                match sqlx::query_scalar("SELECT pg_last_wal_replay_lsn()::text")
                    .fetch_one(pool)
                    .await
                {
                    Ok(lsn) => lsn,
                    Err(e) => {
                        warn!(replica = %id, error = %e, "Replica unreachable");
                        continue;
                    }
                };
            match lsn {
                Some(lsn) => replayed.push((id.clone(), lsn)),
                None => warn!(replica = %id, "Node is not in recovery, skipping"),
            }
        }
        self.record_statuses(&replayed).await
    }

    /// Upsert `(replica, lsn)` rows on the primary. A failed row is logged
    /// and does not stop the rest.
    async fn record_statuses(&self, replayed: &[(ReplicaId, String)]) -> usize {
        let mut recorded = 0;
        for (id, lsn) in replayed {
            let result = sqlx::query(
                r#"
                INSERT INTO replica_statuses (name, last_lsn, updated_at)
                VALUES ($1, $2::pg_lsn, now())
                ON CONFLICT (name) DO UPDATE
                SET last_lsn = EXCLUDED.last_lsn, updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(id.as_str())
            .bind(lsn)
            .execute(&self.primary)
            .await;
            match result {
                Ok(_) => recorded += 1,
                Err(e) => warn!(replica = %id, error = %e, "Failed to record replica status"),
            }
        }
        recorded
    }

    /// Refresh replica statuses every `interval` in the background.
    pub fn spawn_status_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let refreshed = cluster.refresh_statuses().await;
                debug!(refreshed, total = cluster.replicas.len(), "Replica statuses refreshed");
            }
        })
    }

    fn pool_for(&self, target: &Target) -> Result<&PgPool> {
        match target {
            Target::Primary => Ok(&self.primary),
            Target::Replica(id) => self
                .replicas
                .get(id)
                .ok_or_else(|| Error::UnknownReplica(id.to_string())),
        }
    }
}

#[async_trait]
impl AccountStore for PgCluster {
    async fn find_by_credential(&self, credential: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, email, min_lsn::text FROM users WHERE email = $1",
        )
        .bind(credential)
        .fetch_optional(&self.primary)
        .await?;

        row.map(account_from_row).transpose()
    }

    async fn ensure_account(&self, email: &str) -> Result<Account> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            INSERT INTO users (email) VALUES ($1)
            ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
            RETURNING id, email, min_lsn::text
            "#,
        )
        .bind(email)
        .fetch_one(&self.primary)
        .await?;

        account_from_row(row)
    }
}

#[async_trait]
impl PositionTracker for PgCluster {
    async fn required_position(&self, account: AccountId) -> Result<Option<Lsn>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT min_lsn::text FROM users WHERE id = $1")
                .bind(account)
                .fetch_optional(&self.primary)
                .await?;

        match row {
            Some((min_lsn,)) => min_lsn.as_deref().map(parse_lsn).transpose(),
            None => Err(Error::SessionNotFound(account)),
        }
    }

    async fn advance_required_position(&self, account: AccountId, position: Lsn) -> Result<Lsn> {
        // GREATEST ignores NULL, so a first write stores `position` as is
        let stored: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE users SET min_lsn = GREATEST(min_lsn, $2::pg_lsn)
            WHERE id = $1
            RETURNING min_lsn::text
            "#,
        )
        .bind(account)
        .bind(position.to_string())
        .fetch_optional(&self.primary)
        .await?;

        match stored {
            Some(text) => parse_lsn(&text),
            None => Err(Error::SessionNotFound(account)),
        }
    }
}

#[async_trait]
impl ReplicaStatusStore for PgCluster {
    async fn replica_statuses(&self, candidates: &[ReplicaId]) -> Result<Vec<ReplicaStatus>> {
        let names: Vec<String> = candidates.iter().map(|id| id.to_string()).collect();
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT name, last_lsn::text, updated_at FROM replica_statuses WHERE name = ANY($1)",
        )
        .bind(names)
        .fetch_all(&self.primary)
        .await
        .map_err(|e| Error::ReplicaStoreUnavailable(e.to_string()))?;

        rows.into_iter()
            .map(|(name, last_lsn, observed_at)| {
                Ok(ReplicaStatus {
                    replica_id: ReplicaId::new(name),
                    last_applied: parse_lsn(&last_lsn)?,
                    observed_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PrimaryStore for PgCluster {
    async fn insert_ride(&self, ride: &NewRide) -> Result<Ride> {
        let mut tx = self.primary.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, RideRow>(
            r#"
            INSERT INTO rides (distance, user_id, created_at)
            VALUES ($1, $2, now())
            RETURNING id, distance, user_id
            "#,
        )
        .bind(ride.distance)
        .bind(ride.user_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ride_from_row(row))
    }

    async fn current_position(&self) -> Result<Lsn> {
        let text: String = sqlx::query_scalar("SELECT pg_current_wal_lsn()::text")
            .fetch_one(&self.primary)
            .await?;
        parse_lsn(&text)
    }
}

#[async_trait]
impl RideReader for PgCluster {
    async fn find_ride(&self, target: &Target, id: RideId) -> Result<Option<Ride>> {
        let row = sqlx::query_as::<_, RideRow>(
            "SELECT id, distance, user_id FROM rides WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool_for(target)?)
        .await?;

        Ok(row.map(ride_from_row))
    }
}
