use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use tokio::time::Instant;

/// Expiring counters. `incr` creates a counter together with its expiry in one
/// atomic operation, so a counter can never exist without one.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment and return the new value. An absent or expired key starts at 1 with `ttl`.
    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<u64>;

    /// Drop expired counters; returns how many were removed.
    async fn purge_expired(&self) -> anyhow::Result<u64>;

    async fn ping(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

impl Counter {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Clone, Default)]
pub struct MemoryCounterStore {
    counters: Arc<DashMap<String, Counter>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<u64> {
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + ttl,
        });
        if !entry.live(now) {
            *entry = Counter {
                count: 0,
                expires_at: now + ttl,
            };
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, c| c.live(now));
        Ok(before.saturating_sub(self.counters.len()) as u64)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Counters in a `rate_limits` table, shared by every instance using the database.
#[derive(Clone)]
pub struct PgCounterStore {
    db: PgPool,
}

impl PgCounterStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO rate_limits (key, count, expires_at)
            VALUES ($1, 1, now() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE
               SET count = CASE WHEN rate_limits.expires_at > now()
                                THEN rate_limits.count + 1 ELSE 1 END,
                   expires_at = CASE WHEN rate_limits.expires_at > now()
                                     THEN rate_limits.expires_at ELSE EXCLUDED.expires_at END
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .fetch_one(&self.db)
        .await
        .context("increment rate limit counter")?;
        Ok(count.max(0) as u64)
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM rate_limits WHERE expires_at <= now()")
            .execute(&self.db)
            .await
            .context("purge rate limit counters")?;
        Ok(res.rows_affected())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.db)
            .await
            .context("ping rate limit database")?;
        Ok(())
    }
}
