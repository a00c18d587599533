//! External collaborator traits the core consumes, plus in-memory reference
//! implementations so the pipeline is runnable and testable standalone.
//!
//! User registration, credential verification, and session issuance are out of scope
//! (see the crate-level docs); these traits are the seam a production deployment
//! would replace with a real auth service and a real database.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rusqlite::Connection;
use tokio::sync::Mutex as AsyncMutex;

use crate::models::{Position, PositionStatus, Symbol, UserId};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Resolves an opaque session credential to the user it belongs to, or `None`
    /// if the credential is invalid or expired.
    async fn validate(&self, session_id: &str) -> Option<UserId>;
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn open_positions_of(&self, user: UserId) -> anyhow::Result<Vec<Position>>;
    async fn open_symbols_of(&self, user: UserId) -> anyhow::Result<HashSet<Symbol>> {
        Ok(self
            .open_positions_of(user)
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .collect())
    }
}

/// Minimal record-of-trades interface the gateway could call when wired to a real
/// trading API layer. The core pipeline never calls it directly; it exists as a
/// trait boundary for that integration.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn record_open(&self, position: &Position) -> anyhow::Result<()>;
    async fn record_close(&self, position: &Position) -> anyhow::Result<()>;
}

/// In-memory `SessionStore`: session id strings are pre-registered against a user.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, UserId>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: impl Into<String>, user: UserId) {
        self.sessions.write().insert(session_id.into(), user);
    }

    pub fn revoke(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn validate(&self, session_id: &str) -> Option<UserId> {
        self.sessions.read().get(session_id).copied()
    }
}

/// In-memory `PositionStore`, used by the demo binary and the test suite.
#[derive(Default)]
pub struct InMemoryPositionStore {
    positions: RwLock<HashMap<UserId, Vec<Position>>>,
}

impl InMemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, position: Position) {
        self.positions
            .write()
            .entry(position.user_id)
            .or_default()
            .push(position);
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn open_positions_of(&self, user: UserId) -> anyhow::Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .get(&user)
            .map(|positions| {
                positions
                    .iter()
                    .filter(|p| p.status == PositionStatus::Open)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryTradeStore {
    opened: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
}

impl InMemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeStore for InMemoryTradeStore {
    async fn record_open(&self, position: &Position) -> anyhow::Result<()> {
        self.opened.write().push(position.clone());
        Ok(())
    }

    async fn record_close(&self, position: &Position) -> anyhow::Result<()> {
        self.closed.write().push(position.clone());
        Ok(())
    }
}

/// `rusqlite`-backed reference `PositionStore`, using a connection-per-call style
/// over a shared, mutex-guarded `Connection`.
pub struct SqlitePositionStore {
    conn: Arc<AsyncMutex<Connection>>,
}

impl SqlitePositionStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                status TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                exit_price TEXT,
                opened_at TEXT NOT NULL,
                closed_at TEXT
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
        })
    }
}

#[async_trait]
impl PositionStore for SqlitePositionStore {
    async fn open_positions_of(&self, user: UserId) -> anyhow::Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, symbol, side, quantity, entry_price, status,
                    realized_pnl, exit_price, opened_at, closed_at
             FROM positions WHERE user_id = ?1 AND status = 'OPEN'",
        )?;
        let rows = stmt.query_map([user.0.to_string()], row_to_position)?;
        let mut positions = Vec::new();
        for row in rows {
            positions.push(row?);
        }
        Ok(positions)
    }
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    use rust_decimal::Decimal;
    use std::str::FromStr;

    let parse_decimal = |s: String| Decimal::from_str(&s).unwrap_or_default();

    let side: String = row.get(3)?;
    let status: String = row.get(6)?;
    let exit_price: Option<String> = row.get(8)?;
    let closed_at: Option<String> = row.get(10)?;

    Ok(Position {
        id: uuid::Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        user_id: UserId(uuid::Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default()),
        symbol: Symbol::normalize(&row.get::<_, String>(2)?),
        side: if side == "LONG" {
            crate::models::PositionSide::Long
        } else {
            crate::models::PositionSide::Short
        },
        quantity: parse_decimal(row.get(4)?),
        entry_price: parse_decimal(row.get(5)?),
        status: if status == "OPEN" {
            PositionStatus::Open
        } else {
            PositionStatus::Closed
        },
        realized_pnl: parse_decimal(row.get(7)?),
        exit_price: exit_price.map(parse_decimal),
        opened_at: row
            .get::<_, String>(9)?
            .parse()
            .unwrap_or_else(|_| chrono::Utc::now()),
        closed_at: closed_at.and_then(|s| s.parse().ok()),
    })
}
