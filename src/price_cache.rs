//! Latest-known price per symbol, with lazy TTL expiry.
//!
//! Backed by `arc_swap::ArcSwap<HashMap<Symbol, PriceEntry>>`: a bulk write builds
//! the next generation by cloning-and-merging the previous one, then stores it in
//! one atomic swap, so readers never observe a torn mix of old and new prices.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;

use crate::models::{PriceEntry, Symbol, Tick};

pub struct PriceCache {
    snapshot: ArcSwap<HashMap<Symbol, PriceEntry>>,
    ttl: Duration,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            ttl,
        }
    }

    /// Atomically merges `ticks` into the cache. All keys become visible to readers at
    /// once.
    pub fn set_bulk(&self, ticks: &HashMap<Symbol, Tick>) {
        loop {
            let current = self.snapshot.load();
            let mut next: HashMap<Symbol, PriceEntry> = (**current).clone();
            for (symbol, tick) in ticks {
                next.insert(
                    symbol.clone(),
                    PriceEntry {
                        symbol: symbol.clone(),
                        price: tick.price,
                        volume_24h: tick.volume_24h,
                        change_pct_24h: tick.change_pct_24h,
                        timestamp: tick.timestamp,
                    },
                );
            }
            let next = Arc::new(next);
            let prev = self.snapshot.compare_and_swap(&current, next);
            if Arc::ptr_eq(&prev, &current) {
                return;
            }
        }
    }

    /// Returns the entry for `symbol`, or `None` if absent or expired.
    pub fn get(&self, symbol: &Symbol) -> Option<PriceEntry> {
        let snapshot = self.snapshot.load();
        let entry = snapshot.get(symbol)?;
        if self.is_expired(entry) {
            return None;
        }
        Some(entry.clone())
    }

    /// Returns an entry (or `None`) for every requested symbol, expired entries
    /// treated as absent.
    pub fn get_bulk(&self, symbols: &[Symbol]) -> HashMap<Symbol, Option<PriceEntry>> {
        let snapshot = self.snapshot.load();
        symbols
            .iter()
            .map(|s| {
                let entry = snapshot.get(s).filter(|e| !self.is_expired(e)).cloned();
                (s.clone(), entry)
            })
            .collect()
    }

    fn is_expired(&self, entry: &PriceEntry) -> bool {
        let age = Utc::now().signed_duration_since(entry.timestamp);
        match age.to_std() {
            Ok(age) => age > self.ttl,
            Err(_) => false, // timestamp is in the future; treat as fresh
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;

    fn tick(symbol: &str, price: i64, age_secs: i64) -> Tick {
        Tick {
            symbol: Symbol::normalize(symbol),
            price: Decimal::from(price),
            volume_24h: None,
            change_pct_24h: None,
            high_24h: None,
            low_24h: None,
            timestamp: Utc::now() - ChronoDuration::seconds(age_secs),
        }
    }

    #[test]
    fn unknown_symbol_is_absent_not_error() {
        let cache = PriceCache::new(Duration::from_secs(60));
        assert!(cache.get(&Symbol::normalize("BTCUSDT")).is_none());
    }

    #[test]
    fn bulk_set_then_get_reflects_latest() {
        let cache = PriceCache::new(Duration::from_secs(60));
        let mut batch = HashMap::new();
        batch.insert(Symbol::normalize("BTCUSDT"), tick("BTCUSDT", 100, 0));
        cache.set_bulk(&batch);
        let entry = cache.get(&Symbol::normalize("BTCUSDT")).unwrap();
        assert_eq!(entry.price, Decimal::from(100));
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let cache = PriceCache::new(Duration::from_secs(1));
        let mut batch = HashMap::new();
        batch.insert(Symbol::normalize("BTCUSDT"), tick("BTCUSDT", 100, 5));
        cache.set_bulk(&batch);
        assert!(cache.get(&Symbol::normalize("BTCUSDT")).is_none());
    }

    #[test]
    fn bulk_write_is_atomic_across_keys() {
        let cache = PriceCache::new(Duration::from_secs(60));
        let mut first = HashMap::new();
        first.insert(Symbol::normalize("A"), tick("A", 1, 0));
        first.insert(Symbol::normalize("B"), tick("B", 1, 0));
        cache.set_bulk(&first);

        let mut second = HashMap::new();
        second.insert(Symbol::normalize("A"), tick("A", 2, 0));
        second.insert(Symbol::normalize("B"), tick("B", 2, 0));
        cache.set_bulk(&second);

        let bulk = cache.get_bulk(&[Symbol::normalize("A"), Symbol::normalize("B")]);
        assert_eq!(bulk[&Symbol::normalize("A")].as_ref().unwrap().price, Decimal::from(2));
        assert_eq!(bulk[&Symbol::normalize("B")].as_ref().unwrap().price, Decimal::from(2));
    }
}
