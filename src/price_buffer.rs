//! Coalesces a high-rate per-symbol tick stream into bounded broadcast cycles.
//!
//! A swap-and-clear flush backed by `parking_lot::Mutex` + `std::mem::take`, so
//! `ingest` only ever holds the lock for a single insert.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::models::{Symbol, Tick};

#[derive(Default)]
pub struct PriceBuffer {
    pending: Mutex<HashMap<Symbol, Tick>>,
}

impl PriceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking. Last-write-wins: only the latest tick per symbol survives until
    /// the next flush.
    pub fn ingest(&self, tick: Tick) {
        self.pending.lock().insert(tick.symbol.clone(), tick);
    }

    /// Atomically swaps out the accumulated map, leaving an empty one behind. An
    /// empty result means the caller should skip the broadcast cycle (B1).
    pub fn flush(&self) -> HashMap<Symbol, Tick> {
        std::mem::take(&mut *self.pending.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn tick(symbol: &str, price: i64) -> Tick {
        Tick {
            symbol: Symbol::normalize(symbol),
            price: Decimal::from(price),
            volume_24h: None,
            change_pct_24h: None,
            high_24h: None,
            low_24h: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn empty_flush_yields_empty_map() {
        let buf = PriceBuffer::new();
        assert!(buf.flush().is_empty());
    }

    #[test]
    fn coalesces_to_latest_tick_per_symbol() {
        let buf = PriceBuffer::new();
        for price in 1..=50 {
            buf.ingest(tick("BTCUSDT", price));
        }
        let flushed = buf.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[&Symbol::normalize("BTCUSDT")].price, Decimal::from(50));
    }

    #[test]
    fn flush_clears_pending_for_next_cycle() {
        let buf = PriceBuffer::new();
        buf.ingest(tick("BTCUSDT", 1));
        buf.flush();
        assert!(buf.flush().is_empty());
    }
}
