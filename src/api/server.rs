//! API server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::api::http::{create_router, AppState};
use crate::common::config::Backend;
use crate::common::{Config, Result};
use crate::router::{ReplicaId, ReplicaSelector, WriteCoordinator, WritePolicy};
use crate::store::{Backends, MemoryCluster, PgCluster};

/// How often the postgres backend polls replicas for their replay position
const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Wire the router components over one backend.
pub fn build_state(config: &Config, backends: Backends) -> AppState {
    let replicas = config
        .replicas
        .iter()
        .map(|r| ReplicaId::new(r.id.clone()))
        .collect();

    let selector = ReplicaSelector::new(backends.tracker.clone(), backends.status.clone(), replicas)
        .with_status_timeout(config.routing.status_timeout());
    let coordinator = WriteCoordinator::new(
        backends.primary.clone(),
        backends.tracker.clone(),
        WritePolicy::from_config(&config.writes, &config.advance),
    );

    AppState {
        selector: Arc::new(selector),
        coordinator: Arc::new(coordinator),
        backends,
        backend: config.backend,
    }
}

pub struct ApiServer {
    config: Config,
}

impl ApiServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Open the configured backend and start its background task.
    async fn open_backend(&self) -> Result<(Backends, JoinHandle<()>)> {
        match self.config.backend {
            Backend::Memory => {
                let cluster = Arc::new(MemoryCluster::from_config(&self.config));
                let replication = cluster.spawn_replication(
                    Duration::from_millis(self.config.memory.replication_lag_ms),
                    Duration::from_millis(self.config.memory.replication_tick_ms),
                );
                Ok((Backends::from_cluster(cluster), replication))
            }
            Backend::Postgres => {
                let cluster = Arc::new(PgCluster::connect(&self.config).await?);
                cluster.install_schema().await?;
                let refresh = cluster.spawn_status_refresh(STATUS_REFRESH_INTERVAL);
                Ok((Backends::from_cluster(cluster), refresh))
            }
        }
    }

    pub async fn serve(self) -> Result<()> {
        self.config.validate()?;
        let bind_addr = self.config.bind_addr()?;

        tracing::info!("Starting ryw API");
        tracing::info!("  HTTP API: {}", bind_addr);
        tracing::info!("  Backend: {}", self.config.backend);
        tracing::info!("  Replicas: {}", self.config.replicas.len());

        let (backends, background) = self.open_backend().await?;
        for email in &self.config.accounts {
            let account = backends.accounts.ensure_account(email).await?;
            tracing::debug!(account = account.id, email = %email, "Account provisioned");
        }

        let router = create_router(build_state(&self.config, backends));
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        tracing::info!("API ready");

        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        background.abort();
        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        tracing::info!("API stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
