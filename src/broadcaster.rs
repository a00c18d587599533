//! Turns one flush cycle's worth of buffered ticks into fan-out `price_update`
//! frames, then schedules P&L recomputation for every affected user.
//!
//! Each symbol's fan-out runs as its own concurrent task instead of serially,
//! so a slow session's queue can never delay delivery for other symbols or
//! push the next flush late.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::models::{PriceUpdateData, ServerMessage, Symbol, Tick, UserId};
use crate::pnl::PnLEngine;
use crate::price_buffer::PriceBuffer;
use crate::price_cache::PriceCache;
use crate::sessions::SessionRegistry;
use crate::subscription_index::SubscriptionIndex;

/// The collaborators a flush cycle needs. `Core` hands these to
/// `spawn_flush_loop` already `Arc`-wrapped.
pub struct Broadcaster {
    pub buffer: Arc<PriceBuffer>,
    pub price_cache: Arc<PriceCache>,
    pub subscriptions: Arc<SubscriptionIndex>,
    pub sessions: Arc<SessionRegistry>,
    pub pnl_engine: Arc<PnLEngine>,
    pub flush_interval: Duration,
}

impl Broadcaster {
    /// Runs the flush loop until the process exits. One `tokio::interval` tick
    /// drains the buffer and, if non-empty, spawns the broadcast as its own task so
    /// a slow fan-out never pushes the next tick late (B1/B2).
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        loop {
            ticker.tick().await;
            let batch = self.buffer.flush();
            if batch.is_empty() {
                continue;
            }
            let broadcaster = self.clone();
            tokio::spawn(async move {
                broadcaster.flush_batch(batch).await;
            });
        }
    }

    async fn flush_batch(&self, batch: HashMap<Symbol, Tick>) {
        self.price_cache.set_bulk(&batch);
        metrics::counter!("flushes_total").increment(1);
        metrics::gauge!("flush_symbols").set(batch.len() as f64);
        debug!(symbols = batch.len(), "flushing price batch");

        let mut fanouts = Vec::with_capacity(batch.len());
        for (symbol, tick) in &batch {
            let entry = match self.price_cache.get(symbol) {
                Some(entry) => entry,
                None => continue,
            };
            let subscribers = self.subscriptions.subscribers_of(symbol);
            if subscribers.is_empty() {
                continue;
            }
            fanouts.push(self.fan_out_one(symbol.clone(), entry_to_message(&entry), subscribers));
            let _ = tick;
        }

        let results = futures_util::future::join_all(fanouts).await;
        let affected_users: HashSet<UserId> = results.into_iter().flatten().collect();
        if !affected_users.is_empty() {
            info!(users = affected_users.len(), "scheduling pnl recompute after flush");
            self.pnl_engine.schedule(affected_users);
        }
    }

    /// Sends one symbol's `price_update` to every session of every subscriber.
    /// Returns the subscribers so the caller can fold them into the batch's
    /// affected-user set.
    async fn fan_out_one(
        &self,
        symbol: Symbol,
        message: ServerMessage,
        subscribers: HashSet<UserId>,
    ) -> HashSet<UserId> {
        for user in &subscribers {
            for session in self.subscriptions.sessions_of(*user) {
                match self.sessions.send(session, message.clone()) {
                    Ok(()) => metrics::counter!("price_updates_sent_total").increment(1),
                    Err(_) => {
                        debug!(%session, %symbol, "dropping unreachable session during price fan-out");
                    }
                }
            }
        }
        subscribers
    }
}

fn entry_to_message(entry: &crate::models::PriceEntry) -> ServerMessage {
    ServerMessage::PriceUpdate {
        data: PriceUpdateData::from(entry),
    }
}

/// Spawns the flush loop as a background task and returns its `JoinHandle`.
pub fn spawn_flush_loop(broadcaster: Arc<Broadcaster>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(broadcaster.run())
}
