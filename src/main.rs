use std::time::Duration;

use axum::Router;

mod app;
mod auth;
mod config;
mod db;
mod error;
mod rate_limit;
mod response;
mod state;

const COUNTER_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "taskflow=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let app_state = state::AppState::init().await?;
    rate_limit::spawn_purge(app_state.limiter.clone(), COUNTER_PURGE_INTERVAL);

    // Resource routes (projects, tasks, ...) are mounted here.
    let app = app::build_app(app_state, Router::new());
    app::serve(app).await
}
