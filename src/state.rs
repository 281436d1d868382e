use std::sync::Arc;

use crate::auth::repo::{MemoryUserStore, PgUserStore, UserStore};
use crate::config::{AppConfig, StoreBackend};
use crate::db;
use crate::rate_limit::{
    store::{CounterStore, MemoryCounterStore, PgCounterStore},
    RateLimiter,
};

/// Process-wide handles, built once at startup and shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserStore>,
    pub limiter: RateLimiter,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let mut user_pool = None;
        let users: Arc<dyn UserStore> = match config.user_store {
            StoreBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
                let pool = db::connect(url).await?;
                db::migrate(&pool).await;
                user_pool = Some((url.to_string(), pool.clone()));
                Arc::new(PgUserStore::new(pool))
            }
            StoreBackend::Memory => {
                tracing::warn!("USER_STORE=memory: accounts are lost on restart");
                Arc::new(MemoryUserStore::new())
            }
        };

        let counters: Arc<dyn CounterStore> = match config.rate_limit.backend {
            StoreBackend::Postgres => {
                let url = config
                    .rate_limit
                    .database_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("rate limit database url is not set"))?;
                // Reuse the users pool when both point at the same database.
                let pool = match &user_pool {
                    Some((user_url, pool)) if user_url == url => pool.clone(),
                    _ => {
                        let pool = db::connect(url).await?;
                        db::migrate(&pool).await;
                        pool
                    }
                };
                Arc::new(PgCounterStore::new(pool))
            }
            StoreBackend::Memory => Arc::new(MemoryCounterStore::new()),
        };

        // Fail fast on unreachable stores rather than on the first request.
        users.ping().await?;
        if let Err(e) = counters.ping().await {
            tracing::warn!(error = %e, "rate limit store unreachable at startup; limiter fails open");
        }

        let limiter = RateLimiter::new(
            counters,
            config.rate_limit.max_requests,
            std::time::Duration::from_secs(config.rate_limit.window_secs),
        )
        .trust_proxy_headers(config.rate_limit.trust_proxy_headers);

        Ok(Self::from_parts(config, users, limiter))
    }

    pub fn from_parts(config: Arc<AppConfig>, users: Arc<dyn UserStore>, limiter: RateLimiter) -> Self {
        Self {
            config,
            users,
            limiter,
        }
    }

    /// In-memory state for tests.
    #[cfg(test)]
    pub fn fake() -> Self {
        Self::fake_with_counters(Arc::new(MemoryCounterStore::new()))
    }

    #[cfg(test)]
    pub fn fake_with_counters(counters: Arc<dyn CounterStore>) -> Self {
        use crate::config::{JwtConfig, RateLimitConfig};

        let config = Arc::new(AppConfig {
            database_url: None,
            user_store: StoreBackend::Memory,
            jwt: JwtConfig {
                access_secret: "test-access-secret".into(),
                refresh_secret: "test-refresh-secret".into(),
                issuer: "test".into(),
                audience: "test".into(),
                access_ttl_minutes: 5,
                refresh_ttl_minutes: 60 * 24,
            },
            rate_limit: RateLimitConfig {
                backend: StoreBackend::Memory,
                database_url: None,
                max_requests: 10,
                window_secs: 60,
                trust_proxy_headers: false,
            },
            production: false,
        });
        let limiter = RateLimiter::new(counters, 10, std::time::Duration::from_secs(60));
        Self::from_parts(config, Arc::new(MemoryUserStore::new()), limiter)
    }
}
