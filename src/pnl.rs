//! Per-user portfolio P&L recomputation, debounced and optionally cached.
//!
//! Recomputation is cache-check, load open positions, bulk price lookup,
//! per-position unrealized P&L, aggregate totals, cache-write. Debouncing uses a
//! per-user pending-flag rather than one fixed-delay timer, so concurrent batches
//! for different users don't serialize behind a single `sleep`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::warn;

use crate::models::{Position, PositionPnl, PositionSide, PortfolioSnapshot, Symbol, UserId};
use crate::price_cache::PriceCache;
use crate::sessions::SessionRegistry;
use crate::store::PositionStore;
use crate::subscription_index::SubscriptionIndex;
use crate::models::ServerMessage;

struct CachedSnapshot {
    snapshot: PortfolioSnapshot,
    computed_at: Instant,
}

pub struct PnLEngine {
    positions: Arc<dyn PositionStore>,
    price_cache: Arc<PriceCache>,
    subscriptions: Arc<SubscriptionIndex>,
    sessions: Arc<SessionRegistry>,
    debounce: Duration,
    cache_ttl: Duration,
    pending: Mutex<HashSet<UserId>>,
    cache: Mutex<HashMap<UserId, CachedSnapshot>>,
}

impl PnLEngine {
    pub fn new(
        positions: Arc<dyn PositionStore>,
        price_cache: Arc<PriceCache>,
        subscriptions: Arc<SubscriptionIndex>,
        sessions: Arc<SessionRegistry>,
        debounce: Duration,
        cache_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            positions,
            price_cache,
            subscriptions,
            sessions,
            debounce,
            cache_ttl,
            pending: Mutex::new(HashSet::new()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Schedules a debounced recomputation for each of `user_ids`. A user already
    /// pending is a no-op - the in-flight debounce timer will pick up the latest
    /// state when it fires.
    pub fn schedule(self: &Arc<Self>, user_ids: HashSet<UserId>) {
        for user in user_ids {
            let already_pending = {
                let mut pending = self.pending.lock();
                !pending.insert(user)
            };
            if already_pending {
                continue;
            }
            let engine = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(engine.debounce).await;
                engine.pending.lock().remove(&user);
                if let Err(e) = engine.recompute_and_push(user).await {
                    warn!(%user, error = %e, "pnl recompute failed for user");
                }
            });
        }
    }

    /// Recomputes immediately (bypassing the debounce) and returns the snapshot
    /// without pushing it anywhere - used to answer `get_portfolio` and to build
    /// the preload snapshot on connect. Serves from cache when fresh.
    pub async fn recompute_now(&self, user: UserId) -> anyhow::Result<PortfolioSnapshot> {
        if let Some(cached) = self.cache.lock().get(&user) {
            if cached.computed_at.elapsed() < self.cache_ttl {
                return Ok(cached.snapshot.clone());
            }
        }
        self.compute(user).await
    }

    /// Drops any cached snapshot for `user`. Call on position open/close so a
    /// stale cached snapshot never outlives the position it was computed from.
    pub fn invalidate(&self, user: UserId) {
        self.cache.lock().remove(&user);
    }

    async fn recompute_and_push(&self, user: UserId) -> anyhow::Result<()> {
        let snapshot = self.compute(user).await?;
        metrics::counter!("pnl_recomputes_total").increment(1);
        for session in self.subscriptions.sessions_of(user) {
            let _ = self.sessions.send(
                session,
                ServerMessage::PnlUpdate {
                    data: snapshot.clone(),
                },
            );
        }
        Ok(())
    }

    async fn compute(&self, user: UserId) -> anyhow::Result<PortfolioSnapshot> {
        let positions = self.positions.open_positions_of(user).await?;
        let snapshot = build_snapshot(user, &positions, &self.price_cache);
        self.cache.lock().insert(
            user,
            CachedSnapshot {
                snapshot: snapshot.clone(),
                computed_at: Instant::now(),
            },
        );
        Ok(snapshot)
    }
}

/// Pure aggregation step, split out from `PnLEngine::compute` so it can be unit
/// tested without a `PositionStore`/`PriceCache` pair.
fn build_snapshot(user: UserId, positions: &[Position], price_cache: &PriceCache) -> PortfolioSnapshot {
    let symbols: Vec<Symbol> = positions
        .iter()
        .map(|p| p.symbol.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let prices = price_cache.get_bulk(&symbols);

    let mut position_pnls = Vec::with_capacity(positions.len());
    let mut invested = Decimal::ZERO;
    let mut current_value = Decimal::ZERO;

    for position in positions {
        let current_price = prices
            .get(&position.symbol)
            .and_then(|entry| entry.as_ref())
            .map(|entry| entry.price)
            .unwrap_or(position.entry_price);

        let unrealized_pnl = unrealized_pnl(position.side, position.quantity, position.entry_price, current_price);
        let position_invested = position.quantity * position.entry_price;
        let pnl_pct = pnl_pct(unrealized_pnl, position_invested);

        invested += position_invested;
        current_value += position.quantity * current_price;

        position_pnls.push(PositionPnl {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            current_price,
            unrealized_pnl: round_value(unrealized_pnl),
            pnl_pct: round_pct(pnl_pct),
        });
    }

    let total_unrealized_pnl = current_value - invested;
    let total_pnl_pct = pnl_pct(total_unrealized_pnl, invested);

    PortfolioSnapshot {
        user_id: user,
        positions: position_pnls,
        invested: round_value(invested),
        current_value: round_value(current_value),
        unrealized_pnl: round_value(total_unrealized_pnl),
        pnl_pct: round_pct(total_pnl_pct),
        timestamp: chrono::Utc::now(),
    }
}

/// `quantity x (current - entry)` for LONG, `quantity x (entry - current)` for SHORT.
fn unrealized_pnl(side: PositionSide, quantity: Decimal, entry: Decimal, current: Decimal) -> Decimal {
    match side {
        PositionSide::Long => quantity * (current - entry),
        PositionSide::Short => quantity * (entry - current),
    }
}

/// `unrealized_pnl / invested * 100`, zero when invested is zero.
fn pnl_pct(unrealized_pnl: Decimal, invested: Decimal) -> Decimal {
    if invested.is_zero() {
        Decimal::ZERO
    } else {
        (unrealized_pnl / invested) * dec!(100)
    }
}

fn round_value(d: Decimal) -> Decimal {
    d.round_dp(4)
}

fn round_pct(d: Decimal) -> Decimal {
    d.round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionStatus};
    use chrono::Utc;
    use std::time::Duration as StdDuration;
    use uuid::Uuid;

    fn position(user: UserId, symbol: &str, side: PositionSide, qty: i64, entry: i64) -> Position {
        Position {
            id: Uuid::new_v4(),
            user_id: user,
            symbol: Symbol::normalize(symbol),
            side,
            quantity: Decimal::from(qty),
            entry_price: Decimal::from(entry),
            status: PositionStatus::Open,
            realized_pnl: Decimal::ZERO,
            exit_price: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn long_breakeven_pnl_is_zero() {
        assert_eq!(
            unrealized_pnl(PositionSide::Long, Decimal::ONE, Decimal::from(100), Decimal::from(100)),
            Decimal::ZERO
        );
    }

    #[test]
    fn long_pnl_flips_sign_across_entry() {
        let up = unrealized_pnl(PositionSide::Long, Decimal::ONE, Decimal::from(100), Decimal::from(110));
        let down = unrealized_pnl(PositionSide::Long, Decimal::ONE, Decimal::from(100), Decimal::from(90));
        assert!(up > Decimal::ZERO);
        assert!(down < Decimal::ZERO);
    }

    #[test]
    fn short_pnl_matches_scenario_s4() {
        let pnl = unrealized_pnl(PositionSide::Short, Decimal::from(2), Decimal::from(200), Decimal::from(180));
        assert_eq!(pnl, Decimal::from(40));
        let pct = pnl_pct(pnl, Decimal::from(2) * Decimal::from(200));
        assert_eq!(round_pct(pct), Decimal::new(1000, 2)); // 10.00
    }

    #[test]
    fn pnl_pct_is_zero_when_nothing_invested() {
        assert_eq!(pnl_pct(Decimal::from(5), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn build_snapshot_falls_back_to_entry_price_when_symbol_absent() {
        let cache = PriceCache::new(StdDuration::from_secs(60));
        let user = UserId::new();
        let positions = vec![position(user, "BTCUSDT", PositionSide::Long, 1, 100)];
        let snapshot = build_snapshot(user, &positions, &cache);
        assert_eq!(snapshot.positions[0].current_price, Decimal::from(100));
        assert_eq!(snapshot.unrealized_pnl, Decimal::ZERO);
    }

    #[test]
    fn build_snapshot_matches_scenario_s1() {
        let cache = PriceCache::new(StdDuration::from_secs(60));
        let user = UserId::new();
        let mut ticks = HashMap::new();
        ticks.insert(
            Symbol::normalize("BTCUSDT"),
            crate::models::Tick {
                symbol: Symbol::normalize("BTCUSDT"),
                price: Decimal::from(110),
                volume_24h: None,
                change_pct_24h: None,
                high_24h: None,
                low_24h: None,
                timestamp: Utc::now(),
            },
        );
        cache.set_bulk(&ticks);

        let positions = vec![position(user, "BTCUSDT", PositionSide::Long, 1, 100)];
        let snapshot = build_snapshot(user, &positions, &cache);
        assert_eq!(snapshot.unrealized_pnl, Decimal::from(10));
        assert_eq!(snapshot.pnl_pct, Decimal::new(1000, 2));
    }
}
