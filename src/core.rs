//! Single composed application value, constructed once at startup and shared (via
//! `Arc`) with every connection handler and background task, rather than scattered
//! as module-level singletons, so the whole dependency graph is visible at one
//! call site and passes explicitly through axum's `State` extractor and into
//! every spawned task.

use std::sync::Arc;

use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::pnl::PnLEngine;
use crate::price_buffer::PriceBuffer;
use crate::price_cache::PriceCache;
use crate::sessions::SessionRegistry;
use crate::store::{PositionStore, SessionStore};
use crate::subscription_index::SubscriptionIndex;
use crate::upstream::UpstreamHandle;

pub struct Core {
    pub config: Config,
    pub price_cache: Arc<PriceCache>,
    pub price_buffer: Arc<PriceBuffer>,
    pub subscriptions: Arc<SubscriptionIndex>,
    pub sessions: Arc<SessionRegistry>,
    pub pnl_engine: Arc<PnLEngine>,
    pub upstream: UpstreamHandle,
    pub session_store: Arc<dyn SessionStore>,
    pub position_store: Arc<dyn PositionStore>,
}

impl Core {
    /// Assembles every component from `config` plus the two external stores the
    /// deployment supplies, spawns the upstream consumer, and returns the `Core`
    /// and its `Broadcaster` (the caller spawns the broadcaster's flush loop
    /// separately, since `main` wants to log the bind address first).
    pub fn build(
        config: Config,
        session_store: Arc<dyn SessionStore>,
        position_store: Arc<dyn PositionStore>,
    ) -> (Arc<Self>, Arc<Broadcaster>) {
        let price_cache = Arc::new(PriceCache::new(config.price_ttl));
        let price_buffer = Arc::new(PriceBuffer::new());
        let subscriptions = Arc::new(SubscriptionIndex::new(config.max_sessions_per_user));
        let sessions = Arc::new(SessionRegistry::new());

        let pnl_engine = PnLEngine::new(
            position_store.clone(),
            price_cache.clone(),
            subscriptions.clone(),
            sessions.clone(),
            config.pnl_debounce,
            config.pnl_cache_ttl,
        );

        let upstream = crate::upstream::UpstreamConsumer::new(
            config.upstream_url.clone(),
            price_buffer.clone(),
            config.max_reconnect_attempts,
            config.keepalive_interval,
            config.keepalive_timeout,
        )
        .spawn();

        let broadcaster = Arc::new(Broadcaster {
            buffer: price_buffer.clone(),
            price_cache: price_cache.clone(),
            subscriptions: subscriptions.clone(),
            sessions: sessions.clone(),
            pnl_engine: pnl_engine.clone(),
            flush_interval: config.flush_interval,
        });

        let core = Arc::new(Self {
            config,
            price_cache,
            price_buffer,
            subscriptions,
            sessions,
            pnl_engine,
            upstream,
            session_store,
            position_store,
        });

        (core, broadcaster)
    }
}
