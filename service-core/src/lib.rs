//! service-core: Shared infrastructure for the developer key services.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;

pub use axum;
