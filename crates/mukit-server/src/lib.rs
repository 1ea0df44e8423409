//! Read-only HTTP status surface over any [`StatusSource`](mukit_core::StatusSource).

pub mod health;
pub mod server;

pub use health::{health_check, HealthResponse};
pub use server::{build_router, serve, AppState};
