//! Route modules for Codedrop Server

use axum::Router;

use crate::state::AppState;

pub mod health;
pub mod transfer;

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .merge(transfer::router())
        .with_state(state)
}
