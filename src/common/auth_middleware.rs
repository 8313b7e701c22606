//! Authentication middleware for the rides routes
//!
//! The `Authorization` header carries the account credential verbatim.
//! A resolved [`Account`] is placed in the request extensions for handlers
//! to extract.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

use crate::common::Error;
use crate::store::{Account, AccountStore};

/// Authenticated account for the current request
#[derive(Clone, Debug)]
pub struct AuthExtension(pub Account);

/// State for auth middleware
#[derive(Clone)]
pub struct AuthState {
    pub accounts: Arc<dyn AccountStore>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let credential = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if credential.is_empty() {
        return Error::MissingCredentials.into_response();
    }

    match state.accounts.find_by_credential(&credential).await {
        Ok(Some(account)) => {
            debug!(account = account.id, "Authenticated");
            request.extensions_mut().insert(AuthExtension(account));
            next.run(request).await
        }
        Ok(None) => Error::InvalidCredentials.into_response(),
        Err(e) => e.into_response(),
    }
}
