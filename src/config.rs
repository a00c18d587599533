//! Environment-driven configuration, loaded once at startup.

use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_url: String,
    pub bind_addr: String,
    pub flush_interval: Duration,
    pub pnl_debounce: Duration,
    pub pnl_cache_ttl: Duration,
    pub price_ttl: Duration,
    pub max_sessions_per_user: usize,
    pub max_reconnect_attempts: u32,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub session_write_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let upstream_url = std::env::var("UPSTREAM_URL").unwrap_or_else(|_| {
            "wss://stream.binance.com:9443/stream".to_string()
        });

        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let flush_interval_ms = parse_env("FLUSH_INTERVAL_MS", 100u64)?;
        let pnl_debounce_ms = parse_env("PNL_DEBOUNCE_MS", 50u64)?;
        let pnl_cache_ttl_s = parse_env("PNL_CACHE_TTL_SECS", 5u64)?;
        let price_ttl_s = parse_env("PRICE_TTL_SECS", 60u64)?;
        let max_sessions_per_user = parse_env("MAX_SESSIONS_PER_USER", 3usize)?;
        let max_reconnect_attempts = parse_env("MAX_RECONNECT_ATTEMPTS", 10u32)?;
        let keepalive_interval_s = parse_env("KEEPALIVE_INTERVAL_SECS", 20u64)?;
        let keepalive_timeout_s = parse_env("KEEPALIVE_TIMEOUT_SECS", 10u64)?;
        let outbound_queue_capacity = parse_env("OUTBOUND_QUEUE_CAPACITY", 256usize)?;
        let session_write_timeout_ms = parse_env("SESSION_WRITE_TIMEOUT_MS", 5_000u64)?;

        Ok(Self {
            upstream_url,
            bind_addr,
            flush_interval: Duration::from_millis(flush_interval_ms),
            pnl_debounce: Duration::from_millis(pnl_debounce_ms),
            pnl_cache_ttl: Duration::from_secs(pnl_cache_ttl_s),
            price_ttl: Duration::from_secs(price_ttl_s),
            max_sessions_per_user,
            max_reconnect_attempts,
            keepalive_interval: Duration::from_secs(keepalive_interval_s),
            keepalive_timeout: Duration::from_secs(keepalive_timeout_s),
            outbound_queue_capacity,
            session_write_timeout: Duration::from_millis(session_write_timeout_ms),
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr + ToString,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
