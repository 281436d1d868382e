use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    auth::{self, middleware::{identity_gate, require_api_key}},
    error::{attach_error_stack, ApiError},
    response::ApiResponse,
    state::AppState,
};

/// Full application router. `downstream` holds resource routes mounted
/// behind the identity gate and the API-key gate.
pub fn build_app(state: AppState, downstream: Router<AppState>) -> Router {
    let downstream = downstream
        .layer(from_fn(require_api_key))
        .layer(from_fn_with_state(state.clone(), identity_gate));

    Router::new()
        .merge(auth::router(state.clone()))
        .merge(downstream)
        .route("/health", get(health))
        .layer(from_fn_with_state(state.clone(), attach_error_stack))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!("http_request", %method, uri = %uri, status = tracing::field::Empty)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        let latency_ms = latency.as_millis() as u64;
                        if status.is_server_error() {
                            tracing::error!(%status, latency_ms, "response");
                        } else {
                            tracing::info!(%status, latency_ms, "response");
                        }
                    },
                ),
        )
}

async fn health(State(state): State<AppState>) -> Result<ApiResponse<Value>, ApiError> {
    match state.users.ping().await {
        Ok(()) => Ok(ApiResponse::ok("OK", json!({ "status": "ok" }))),
        Err(e) => Err(ApiError {
            source: Some(e),
            ..ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable")
        }),
    }
}

pub async fn serve(app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        std::env::var("APP_PORT").unwrap_or_else(|_| "8080".into())
    )
    .parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
