//! End-to-end tests wiring a real `Core` (real timer-driven flush loop, real
//! `SubscriptionIndex`/`SessionRegistry`) against the in-memory store reference
//! implementations, without a live upstream or a real socket.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::timeout;

use paperfeed_backend::broadcaster::spawn_flush_loop;
use paperfeed_backend::config::Config;
use paperfeed_backend::core::Core;
use paperfeed_backend::models::{
    Position, PositionSide, PositionStatus, ServerMessage, SessionId, Symbol, Tick, UserId,
};
use paperfeed_backend::sessions::SessionFrame;
use paperfeed_backend::store::{InMemoryPositionStore, InMemorySessionStore, SessionStore};
use paperfeed_backend::subscription_index::AddSessionOutcome;
use uuid::Uuid;

fn test_config() -> Config {
    Config {
        upstream_url: "wss://example.invalid/stream".to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        flush_interval: Duration::from_millis(20),
        pnl_debounce: Duration::from_millis(5),
        pnl_cache_ttl: Duration::from_secs(5),
        price_ttl: Duration::from_secs(60),
        max_sessions_per_user: 2,
        max_reconnect_attempts: 0,
        keepalive_interval: Duration::from_secs(20),
        keepalive_timeout: Duration::from_secs(10),
        outbound_queue_capacity: 256,
        session_write_timeout: Duration::from_secs(5),
    }
}

fn open_position(user: UserId, symbol: &str, side: PositionSide, qty: i64, entry: i64) -> Position {
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

/// Registers a session against `core` the way the gateway would, minus the
/// actual socket: add_session, wire an mpsc pair into the SessionRegistry, and
/// subscribe it to `symbols`.
fn connect_session(
    core: &Arc<Core>,
    user: UserId,
    symbols: &[&str],
) -> (SessionId, mpsc::Receiver<SessionFrame>) {
    let session = SessionId::new();
    assert_eq!(core.subscriptions.add_session(user, session), AddSessionOutcome::Accepted);
    let (tx, rx) = mpsc::channel(32);
    core.sessions.register(session, user, tx);
    let symbols: Vec<Symbol> = symbols.iter().map(|s| Symbol::normalize(s)).collect();
    core.subscriptions.subscribe(user, &symbols);
    (session, rx)
}

async fn next_message(rx: &mut mpsc::Receiver<SessionFrame>) -> ServerMessage {
    match timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("channel closed")
    {
        SessionFrame::Message(message) => message,
        SessionFrame::Close => panic!("unexpected close frame"),
    }
}

async fn next_price_update(rx: &mut mpsc::Receiver<SessionFrame>) -> ServerMessage {
    loop {
        let msg = next_message(rx).await;
        if matches!(msg, ServerMessage::PriceUpdate { .. }) {
            return msg;
        }
    }
}

async fn next_pnl_update(rx: &mut mpsc::Receiver<SessionFrame>) -> ServerMessage {
    loop {
        let msg = next_message(rx).await;
        if matches!(msg, ServerMessage::PnlUpdate { .. }) {
            return msg;
        }
    }
}

/// S1: single user, single symbol, single tick -> price_update(price=110) and
/// pnl_update(unrealized_pnl=10, pnl_pct=10.00).
#[tokio::test]
async fn single_user_single_symbol_single_tick() {
    let user = UserId::new();
    let positions = Arc::new(InMemoryPositionStore::new());
    positions.insert(open_position(user, "BTCUSDT", PositionSide::Long, 1, 100));
    let session_store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let (core, broadcaster) = Core::build(test_config(), session_store, positions);
    spawn_flush_loop(broadcaster);

    let (_session, mut rx) = connect_session(&core, user, &["BTCUSDT"]);

    core.price_buffer.ingest(tick("BTCUSDT", 110));

    let price_msg = next_price_update(&mut rx).await;
    match price_msg {
        ServerMessage::PriceUpdate { data } => assert_eq!(data.price, Decimal::from(110)),
        _ => unreachable!(),
    }

    let pnl_msg = next_pnl_update(&mut rx).await;
    match pnl_msg {
        ServerMessage::PnlUpdate { data } => {
            assert_eq!(data.unrealized_pnl, Decimal::from(10));
            assert_eq!(data.pnl_pct, Decimal::new(1000, 2));
        }
        _ => unreachable!(),
    }
}

/// S3: two users subscribed to ETHUSDT, one of them also to BTCUSDT; a flush
/// containing both symbols yields 2 frames to the dual-subscriber and 1 to the
/// other, and both users are affected for P&L purposes.
#[tokio::test]
async fn fan_out_delivers_once_per_subscribed_symbol() {
    let u1 = UserId::new();
    let u2 = UserId::new();
    let positions = Arc::new(InMemoryPositionStore::new());
    let session_store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let (core, broadcaster) = Core::build(test_config(), session_store, positions);
    spawn_flush_loop(broadcaster);

    let (_s1, mut rx1) = connect_session(&core, u1, &["ETHUSDT", "BTCUSDT"]);
    let (_s2, mut rx2) = connect_session(&core, u2, &["ETHUSDT"]);

    core.price_buffer.ingest(tick("ETHUSDT", 2000));
    core.price_buffer.ingest(tick("BTCUSDT", 50000));

    let mut u1_prices = 0;
    for _ in 0..2 {
        next_price_update(&mut rx1).await;
        u1_prices += 1;
    }
    assert_eq!(u1_prices, 2);

    let u2_price = next_price_update(&mut rx2).await;
    assert!(matches!(u2_price, ServerMessage::PriceUpdate { .. }));
    // u2 only ever subscribed to one symbol - a second price_update should not show up.
    assert!(timeout(Duration::from_millis(100), next_price_update(&mut rx2)).await.is_err());
}

/// S4: SHORT 2.0 @ 200.0, current 180.0 -> unrealized_pnl=40.0, pnl_pct=10.00.
#[tokio::test]
async fn short_position_pnl_matches_scenario_s4() {
    let user = UserId::new();
    let positions = Arc::new(InMemoryPositionStore::new());
    positions.insert(open_position(user, "BTCUSDT", PositionSide::Short, 2, 200));
    let session_store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let (core, broadcaster) = Core::build(test_config(), session_store, positions);
    spawn_flush_loop(broadcaster);

    let (_session, mut rx) = connect_session(&core, user, &["BTCUSDT"]);
    core.price_buffer.ingest(tick("BTCUSDT", 180));

    let pnl_msg = next_pnl_update(&mut rx).await;
    match pnl_msg {
        ServerMessage::PnlUpdate { data } => {
            assert_eq!(data.unrealized_pnl, Decimal::from(40));
            assert_eq!(data.pnl_pct, Decimal::new(1000, 2));
        }
        _ => unreachable!(),
    }
}

/// S6: per-user session cap = 2 (test_config); a third `add_session` for the same
/// user is rejected and the index still reports exactly 2 sessions.
#[tokio::test]
async fn third_session_over_cap_is_rejected() {
    let user = UserId::new();
    let positions = Arc::new(InMemoryPositionStore::new());
    let session_store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let (core, broadcaster) = Core::build(test_config(), session_store, positions);
    spawn_flush_loop(broadcaster);

    assert_eq!(core.subscriptions.add_session(user, SessionId::new()), AddSessionOutcome::Accepted);
    assert_eq!(core.subscriptions.add_session(user, SessionId::new()), AddSessionOutcome::Accepted);
    assert_eq!(
        core.subscriptions.add_session(user, SessionId::new()),
        AddSessionOutcome::RejectedMaxReached
    );
    assert_eq!(core.subscriptions.sessions_of(user).len(), 2);
}
