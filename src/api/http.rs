//! HTTP API
//!
//! - `POST /rides`: record a ride on the primary, then raise the session's
//!   read bound.
//! - `GET /rides/:id`: read a ride from a node the session's bound allows.
//! - `GET /health`, `GET /replicas`, `GET /metrics`: operational endpoints.
//!
//! Only the rides routes require an `Authorization` header.

use axum::{
    extract::{rejection::FormRejection, Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Form, Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info};

use crate::common::auth_middleware::{auth_middleware, AuthExtension, AuthState};
use crate::common::config::Backend;
use crate::common::metrics::METRICS;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Lsn, Result};
use crate::router::{ReplicaSelector, WriteCoordinator};
use crate::store::{Backends, Ride, RideId};

/// Form key for the ride distance
const DISTANCE: &str = "distance";

/// Upper bound on request bodies
const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub selector: Arc<ReplicaSelector>,
    pub coordinator: Arc<WriteCoordinator>,
    pub backends: Backends,
    pub backend: Backend,
}

/// Ride as returned to clients
#[derive(Debug, Serialize)]
pub struct RideResponse {
    pub distance: f64,
    pub id: RideId,
    pub user_id: i64,
}

impl From<Ride> for RideResponse {
    fn from(ride: Ride) -> Self {
        Self {
            distance: round_tenths(ride.distance),
            id: ride.id,
            user_id: ride.user_id,
        }
    }
}

/// Round to one decimal. Values too large to scale are already whole.
fn round_tenths(value: f64) -> f64 {
    let scaled = value * 10.0;
    if scaled.is_finite() {
        scaled.round() / 10.0
    } else {
        value
    }
}

pub fn create_router(state: AppState) -> Router {
    let auth = AuthState {
        accounts: state.backends.accounts.clone(),
    };

    let rides = Router::new()
        .route("/rides", post(create_ride))
        .route("/rides/:id", get(get_ride))
        .route_layer(middleware::from_fn_with_state(auth, auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/replicas", get(replicas))
        .route("/metrics", get(metrics))
        .merge(rides)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}

/// Value of a required form parameter, rejecting absent and empty values.
fn require_param<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    match params.get(key) {
        Some(value) if !value.is_empty() => Ok(value.as_str()),
        _ => Err(Error::MissingParameter {
            key: key.to_string(),
        }),
    }
}

/// Strict float parse: the whole value must be a finite number.
fn require_float(params: &HashMap<String, String>, key: &str) -> Result<f64> {
    let raw = require_param(params, key)?;
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::InvalidFloat {
            key: key.to_string(),
        })
}

async fn create_ride(
    State(state): State<AppState>,
    Extension(AuthExtension(account)): Extension<AuthExtension>,
    form: std::result::Result<Form<HashMap<String, String>>, FormRejection>,
) -> Result<impl IntoResponse> {
    // An unreadable body carries no parameters
    let params = form.map(|Form(params)| params).unwrap_or_default();
    let distance = require_float(&params, DISTANCE)?;

    let outcome = state.coordinator.create_ride(account.id, distance).await?;
    info!(
        account = account.id,
        ride = outcome.value.id,
        attempts = outcome.attempts,
        bound_advanced = outcome.bound.is_advanced(),
        "Ride created"
    );

    Ok((StatusCode::CREATED, Json(RideResponse::from(outcome.value))))
}

async fn get_ride(
    State(state): State<AppState>,
    Extension(AuthExtension(account)): Extension<AuthExtension>,
    Path(id): Path<String>,
) -> Result<Json<RideResponse>> {
    let not_found = || Error::NotFound {
        kind: "ride",
        id: id.clone(),
    };
    // No row can carry a non-numeric id
    let ride_id: RideId = id.parse().map_err(|_| not_found())?;

    let target = state.selector.select_target(account.id).await;
    debug!(account = account.id, ride = ride_id, %target, "Reading ride");

    match state.backends.reader.find_ride(&target, ride_id).await? {
        Some(ride) => Ok(Json(ride.into())),
        None => Err(not_found()),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "backend": state.backend.to_string(),
        "replicas": state.selector.replicas().len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Latest known position of every configured replica, plus the primary's.
async fn replicas(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let configured = state.selector.replicas();
    let known = state.backends.status.list_replica_positions(configured).await?;
    let primary = state.backends.primary.current_position().await?;

    let positions: BTreeMap<String, Option<Lsn>> = configured
        .iter()
        .map(|id| (id.to_string(), known.get(id).copied()))
        .collect();

    Ok(Json(json!({
        "primary": primary,
        "replicas": positions,
    })))
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}
