pub mod store;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use crate::{error::ApiError, state::AppState};
use store::CounterStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

/// Fixed-window limiter: `max_requests` per identifier per window, counted
/// from the identifier's first request. Windows do not slide, so a client can
/// burst up to twice the limit across a window edge.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    max_requests: u64,
    window: Duration,
    trust_proxy_headers: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, max_requests: u64, window: Duration) -> Self {
        Self {
            store,
            max_requests,
            window,
            trust_proxy_headers: false,
        }
    }

    /// Key clients on `x-forwarded-for` / `x-real-ip`. Only safe behind a proxy
    /// that overwrites those headers.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Count one request for `identifier`. Store failures let the request through.
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        let key = format!("rate_limit:{identifier}");
        match self.store.incr(&key, self.window).await {
            Ok(count) if count > self.max_requests => RateLimitDecision::Limited,
            Ok(_) => RateLimitDecision::Allowed,
            Err(e) => {
                warn!(error = %e, identifier, "rate limit store failed; allowing request");
                RateLimitDecision::Allowed
            }
        }
    }

    /// Caller identity: the socket peer, or the proxy headers when trusted.
    pub fn client_identifier(&self, request: &Request) -> String {
        if self.trust_proxy_headers {
            if let Some(ip) = forwarded_ip(request) {
                return ip;
            }
        }
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn forwarded_ip(request: &Request) -> Option<String> {
    let headers = request.headers();
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|h| h.to_str().ok()))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identifier = state.limiter.client_identifier(&request);
    match state.limiter.check(&identifier).await {
        RateLimitDecision::Allowed => Ok(next.run(request).await),
        RateLimitDecision::Limited => {
            debug!(identifier = %identifier, "rate limited");
            Err(ApiError::too_many_requests())
        }
    }
}

/// Periodically remove expired counters.
pub fn spawn_purge(limiter: RateLimiter, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match limiter.store().purge_expired().await {
                Ok(0) => {}
                Ok(n) => debug!(removed = n, "purged expired rate limit counters"),
                Err(e) => warn!(error = %e, "rate limit purge failed"),
            }
        }
    })
}
