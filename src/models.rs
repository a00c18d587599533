//! Domain types shared across the pipeline: identifiers, positions, ticks, and the
//! client/server wire messages.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalized uppercase trading pair identifier, e.g. `BTCUSDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(pub String);

impl Symbol {
    /// Normalizes arbitrary-case input into the canonical uppercase form used by every
    /// map and message in the pipeline.
    pub fn normalize(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The lowercase stream name the upstream feed expects, e.g. `btcusdt@ticker`.
    pub fn stream_name(&self) -> String {
        format!("{}@ticker", self.0.to_ascii_lowercase())
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

/// Only `Open`/`Closed` exist; see the open-questions note in DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A user's position, owned by the external `PositionStore`. The core reads `OPEN`
/// positions but never mutates this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub status: PositionStatus,
    pub realized_pnl: Decimal,
    pub exit_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// One upstream price update for one symbol at one instant. Ephemeral: lives from
/// arrival to the next flush.
#[derive(Debug, Clone)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: Decimal,
    pub volume_24h: Option<f64>,
    pub change_pct_24h: Option<f64>,
    pub high_24h: Option<Decimal>,
    pub low_24h: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Latest-known price for a symbol, owned by `PriceCache`. Mutated only by
/// `Broadcaster` flushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceEntry {
    pub symbol: Symbol,
    pub price: Decimal,
    pub volume_24h: Option<f64>,
    pub change_pct_24h: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Per-open-position P&L, part of a `PortfolioSnapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionPnl {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub pnl_pct: Decimal,
}

/// Derived, read-only aggregate. Never stored as authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub user_id: UserId,
    pub positions: Vec<PositionPnl>,
    pub invested: Decimal,
    pub current_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub pnl_pct: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Inbound client -> server control messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
    GetPortfolio,
    Ping,
}

/// Outbound server -> client frames. The wrapped `{"type", "data"}` shape is the
/// canonical wire format; see DESIGN.md.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    PriceUpdate { data: PriceUpdateData },
    PnlUpdate { data: PortfolioSnapshot },
    PortfolioSnapshot { data: PortfolioSnapshot },
    Subscribed { symbols: Vec<String> },
    Unsubscribed { symbols: Vec<String> },
    Pong,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceUpdateData {
    pub symbol: Symbol,
    pub price: Decimal,
    pub volume: Option<f64>,
    pub change_24h: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl From<&PriceEntry> for PriceUpdateData {
    fn from(e: &PriceEntry) -> Self {
        Self {
            symbol: e.symbol.clone(),
            price: e.price,
            volume: e.volume_24h,
            change_24h: e.change_pct_24h,
            timestamp: e.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_normalizes_case_and_whitespace() {
        assert_eq!(Symbol::normalize(" btcUsdt ").as_str(), "BTCUSDT");
    }

    #[test]
    fn symbol_stream_name_is_lowercase_ticker() {
        let s = Symbol::normalize("ETHUSDT");
        assert_eq!(s.stream_name(), "ethusdt@ticker");
    }
}
