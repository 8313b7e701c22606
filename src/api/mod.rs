//! HTTP surface of the router

pub mod http;
pub mod server;

pub use http::{create_router, AppState, RideResponse};
pub use server::{build_state, ApiServer};
