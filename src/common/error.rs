//! Error types for ryw
//!
//! Client-facing variants render with the exact messages the HTTP API
//! returns in its `{"error": ...}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE for `serialization_failure`
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for `deadlock_detected`
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

#[derive(Error, Debug)]
pub enum Error {
    // === Authentication Errors ===
    #[error("Please specify credentials in the Authorization header.")]
    MissingCredentials,

    #[error("Credentials in Authorization were invalid.")]
    InvalidCredentials,

    // === Validation Errors ===
    #[error("Please specify parameter '{key}'.")]
    MissingParameter { key: String },

    #[error("Parameter '{key}' must be a floating-point number.")]
    InvalidFloat { key: String },

    // === Lookup Errors ===
    #[error("Object of type '{kind}' with ID '{id}' was not found.")]
    NotFound { kind: &'static str, id: String },

    #[error("Session not found: account {0}")]
    SessionNotFound(i64),

    // === Write Path Errors ===
    /// A single serializable transaction was aborted by a concurrent one.
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// Serialization failures persisted through every retry.
    #[error("Write conflict: transaction aborted after {attempts} attempt(s)")]
    WriteConflict { attempts: usize },

    /// The write committed but the session's consistency bound was not raised.
    #[error("Position advance failed for account {account}: {reason}")]
    PositionAdvance { account: i64, reason: String },

    // === Routing Errors ===
    #[error("Replica status store unavailable: {0}")]
    ReplicaStoreUnavailable(String),

    #[error("Unknown replica: {0}")]
    UnknownReplica(String),

    // === Storage Errors ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Did a serializable transaction abort because of a concurrent conflict?
    pub fn is_serialization_failure(&self) -> bool {
        match self {
            Error::SerializationFailure(_) => true,
            Error::Database(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK_DETECTED)
            ),
            _ => false,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> StatusCode {
        match self {
            Error::MissingCredentials | Error::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Error::MissingParameter { .. } | Error::InvalidFloat { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::ReplicaStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
