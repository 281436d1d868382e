use crate::{rate_limit, state::AppState};
use axum::{middleware::from_fn_with_state, Router};

pub mod claims;
pub mod cookies;
pub mod dto;
pub mod error;
pub(crate) mod extractors;
pub mod handlers;
pub mod jwt;
pub mod middleware;
mod password;
pub mod repo;
pub mod repo_types;
pub mod services;

/// Every `/auth` route, rate limited per client.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::protected_routes(state.clone()))
        .route_layer(from_fn_with_state(state, rate_limit::rate_limit))
}
