//! Common utilities and types shared across ryw

pub mod auth_middleware;
pub mod config;
pub mod error;
pub mod metrics;
pub mod position;
pub mod tracing_middleware;

pub use config::{Backend, Config};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use position::Lsn;
