use anyhow::Context;

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Where a store keeps its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

impl StoreBackend {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => anyhow::bail!("unknown store backend: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_requests: u64,
    pub window_secs: u64,
    /// `TRUST_PROXY_HEADERS`: key clients on `x-forwarded-for` / `x-real-ip`.
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub user_store: StoreBackend,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitConfig,
    /// `APP_ENV=production`: cookies get `Secure` and error bodies drop `stack`.
    pub production: bool,
}

pub const DEFAULT_ACCESS_TTL_MINUTES: i64 = 5;
/// Default `REFRESH_TTL`: one day.
pub const DEFAULT_REFRESH_TTL_MINUTES: i64 = 60 * 24;
pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").filter(|v| !v.is_empty());
        let user_store = match lookup("USER_STORE") {
            Some(v) => StoreBackend::parse(&v)?,
            None => StoreBackend::Postgres,
        };
        if user_store == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL is required when USER_STORE=postgres");
        }

        let jwt = JwtConfig {
            access_secret: lookup("ACCESS_TOKEN_SECRET").context("ACCESS_TOKEN_SECRET")?,
            refresh_secret: lookup("REFRESH_TOKEN_SECRET").context("REFRESH_TOKEN_SECRET")?,
            issuer: lookup("JWT_ISSUER").unwrap_or_else(|| "taskflow".into()),
            audience: lookup("JWT_AUDIENCE").unwrap_or_else(|| "taskflow-users".into()),
            access_ttl_minutes: parse_or(&lookup, "ACCESS_TOKEN_TTL_MINUTES", DEFAULT_ACCESS_TTL_MINUTES),
            refresh_ttl_minutes: parse_or(&lookup, "REFRESH_TOKEN_TTL_MINUTES", DEFAULT_REFRESH_TTL_MINUTES),
        };
        if jwt.access_secret == jwt.refresh_secret {
            tracing::warn!("access and refresh tokens share a signing secret");
        }

        let rate_limit_backend = match lookup("RATE_LIMIT_STORE") {
            Some(v) => StoreBackend::parse(&v)?,
            None => StoreBackend::Memory,
        };
        let rate_limit_url = lookup("RATE_LIMIT_DATABASE_URL")
            .filter(|v| !v.is_empty())
            .or_else(|| database_url.clone());
        if rate_limit_backend == StoreBackend::Postgres && rate_limit_url.is_none() {
            anyhow::bail!("RATE_LIMIT_DATABASE_URL or DATABASE_URL is required when RATE_LIMIT_STORE=postgres");
        }
        let rate_limit = RateLimitConfig {
            backend: rate_limit_backend,
            database_url: rate_limit_url,
            max_requests: parse_or(&lookup, "RATE_LIMIT_MAX_REQUESTS", DEFAULT_RATE_LIMIT_MAX_REQUESTS),
            window_secs: parse_or(&lookup, "RATE_LIMIT_WINDOW_SECS", DEFAULT_RATE_LIMIT_WINDOW_SECS),
            trust_proxy_headers: parse_or(&lookup, "TRUST_PROXY_HEADERS", false),
        };

        let production = lookup("APP_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            user_store,
            jwt,
            rate_limit,
            production,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}
