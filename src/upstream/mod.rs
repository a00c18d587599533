//! Upstream exchange feed: connects to the exchange's public WebSocket, tracks the
//! live subscription set across reconnects, and forwards parsed ticks into a
//! `PriceBuffer`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::models::{Symbol, Tick};
use crate::price_buffer::PriceBuffer;

#[derive(Debug, Clone)]
enum UpstreamCommand {
    Subscribe(Vec<Symbol>),
    Unsubscribe(Vec<Symbol>),
    Shutdown,
}

/// Handle the rest of the core uses to drive the upstream consumer. The consumer
/// itself runs in a background task; this is the only way in.
#[derive(Clone)]
pub struct UpstreamHandle {
    cmd_tx: mpsc::UnboundedSender<UpstreamCommand>,
    connected: Arc<AtomicBool>,
    fatal: Arc<AtomicBool>,
}

impl UpstreamHandle {
    pub fn subscribe(&self, symbols: Vec<Symbol>) {
        let _ = self.cmd_tx.send(UpstreamCommand::Subscribe(symbols));
    }

    pub fn unsubscribe(&self, symbols: Vec<Symbol>) {
        let _ = self.cmd_tx.send(UpstreamCommand::Unsubscribe(symbols));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(UpstreamCommand::Shutdown);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// `true` once the reconnect budget has been exhausted and the consumer has
    /// given up for good. Distinct from `is_connected`, which also goes `false`
    /// during an in-progress reconnect that may still succeed.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }
}

pub struct UpstreamConsumer {
    url: String,
    buffer: Arc<PriceBuffer>,
    max_reconnect_attempts: u32,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
}

impl UpstreamConsumer {
    pub fn new(
        url: impl Into<String>,
        buffer: Arc<PriceBuffer>,
        max_reconnect_attempts: u32,
        keepalive_interval: Duration,
        keepalive_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            buffer,
            max_reconnect_attempts,
            keepalive_interval,
            keepalive_timeout,
        }
    }

    /// Spawns the consumer's run loop and returns a handle to drive it. The loop
    /// runs until `shutdown()` is called or the reconnect budget is exhausted.
    pub fn spawn(self) -> UpstreamHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let fatal = Arc::new(AtomicBool::new(false));
        let handle = UpstreamHandle {
            cmd_tx,
            connected: connected.clone(),
            fatal: fatal.clone(),
        };
        tokio::spawn(self.run_loop(cmd_rx, connected, fatal));
        handle
    }

    async fn run_loop(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<UpstreamCommand>,
        connected: Arc<AtomicBool>,
        fatal: Arc<AtomicBool>,
    ) {
        let mut subscribed: HashSet<Symbol> = HashSet::new();
        let mut attempt: u32 = 0;

        'reconnect: loop {
            if attempt > 0 {
                let wait = backoff_duration(attempt);
                info!(attempt, wait_secs = wait.as_secs(), "backing off before reconnect");
                tokio::time::sleep(wait).await;
            }
            if attempt >= self.max_reconnect_attempts {
                error!(attempt, "exceeded max reconnect attempts, giving up on upstream feed");
                connected.store(false, Ordering::Relaxed);
                fatal.store(true, Ordering::Relaxed);
                return;
            }

            let stream = match tokio_tungstenite::connect_async(&self.url).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, attempt, "upstream connect failed");
                    metrics::counter!("upstream_connect_failures_total").increment(1);
                    attempt += 1;
                    continue 'reconnect;
                }
            };
            info!(url = %self.url, "connected to upstream feed");
            if attempt > 0 {
                metrics::counter!("upstream_reconnects_total").increment(1);
            }
            attempt = 0;
            connected.store(true, Ordering::Relaxed);

            let (mut write, mut read) = stream.split();
            let correlation_id = AtomicU64::new(1);

            if !subscribed.is_empty() {
                let symbols: Vec<Symbol> = subscribed.iter().cloned().collect();
                let frame = build_subscribe_frame(next_id(&correlation_id), &symbols);
                if let Err(e) = write.send(frame).await {
                    warn!(error = %e, "resubscribe send failed, reconnecting");
                    connected.store(false, Ordering::Relaxed);
                    attempt += 1;
                    continue 'reconnect;
                }
            }

            let mut keepalive = tokio::time::interval(self.keepalive_interval);
            keepalive.tick().await; // first tick fires immediately
            let mut last_pong = Instant::now();

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(UpstreamCommand::Subscribe(symbols)) => {
                                let fresh: Vec<Symbol> = symbols.into_iter().filter(|s| subscribed.insert(s.clone())).collect();
                                if !fresh.is_empty() {
                                    let frame = build_subscribe_frame(next_id(&correlation_id), &fresh);
                                    if write.send(frame).await.is_err() {
                                        connected.store(false, Ordering::Relaxed);
                                        attempt += 1;
                                        continue 'reconnect;
                                    }
                                }
                            }
                            Some(UpstreamCommand::Unsubscribe(symbols)) => {
                                let removed: Vec<Symbol> = symbols.into_iter().filter(|s| subscribed.remove(s)).collect();
                                if !removed.is_empty() {
                                    let frame = build_unsubscribe_frame(next_id(&correlation_id), &removed);
                                    if write.send(frame).await.is_err() {
                                        connected.store(false, Ordering::Relaxed);
                                        attempt += 1;
                                        continue 'reconnect;
                                    }
                                }
                            }
                            Some(UpstreamCommand::Shutdown) | None => {
                                let _ = write.send(Message::Close(None)).await;
                                connected.store(false, Ordering::Relaxed);
                                return;
                            }
                        }
                    }
                    _ = keepalive.tick() => {
                        if last_pong.elapsed() > self.keepalive_interval + self.keepalive_timeout {
                            warn!("missed pong within keepalive timeout, reconnecting");
                            connected.store(false, Ordering::Relaxed);
                            attempt += 1;
                            continue 'reconnect;
                        }
                        if timeout(self.keepalive_timeout, write.send(Message::Ping(Vec::new()))).await.is_err() {
                            warn!("ping send timed out, reconnecting");
                            connected.store(false, Ordering::Relaxed);
                            attempt += 1;
                            continue 'reconnect;
                        }
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(tick) = parse_tick_frame(&text) {
                                    metrics::counter!("ticks_ingested_total").increment(1);
                                    self.buffer.ingest(tick);
                                }
                            }
                            Some(Ok(Message::Pong(_))) => {
                                last_pong = Instant::now();
                            }
                            Some(Ok(Message::Ping(_))) => {}
                            Some(Ok(Message::Close(_))) | None => {
                                warn!("upstream closed connection, reconnecting");
                                connected.store(false, Ordering::Relaxed);
                                attempt += 1;
                                continue 'reconnect;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "upstream read error, reconnecting");
                                connected.store(false, Ordering::Relaxed);
                                attempt += 1;
                                continue 'reconnect;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn next_id(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

/// `min(30s, 2^attempt)`.
fn backoff_duration(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.min(30)).min(30);
    Duration::from_secs(secs)
}

fn build_subscribe_frame(id: u64, symbols: &[Symbol]) -> Message {
    let params: Vec<String> = symbols.iter().map(|s| s.stream_name()).collect();
    Message::Text(
        json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": id,
        })
        .to_string(),
    )
}

fn build_unsubscribe_frame(id: u64, symbols: &[Symbol]) -> Message {
    let params: Vec<String> = symbols.iter().map(|s| s.stream_name()).collect();
    Message::Text(
        json!({
            "method": "UNSUBSCRIBE",
            "params": params,
            "id": id,
        })
        .to_string(),
    )
}

/// `true` for SUBSCRIBE/UNSUBSCRIBE acknowledgements (`{"result": null, "id": ...}`),
/// which carry no price data and should be ignored rather than fail to parse.
fn is_ack_frame(value: &Value) -> bool {
    value.get("result").is_some() && value.get("id").is_some()
}

/// Parses one upstream ticker frame into a `Tick`, or `None` for anything else
/// (ack frames, malformed JSON, event types we don't handle). The event-type key
/// is `24hrTicker`.
fn parse_tick_frame(text: &str) -> Option<Tick> {
    let value: Value = serde_json::from_str(text).ok()?;
    if is_ack_frame(&value) {
        return None;
    }
    if value.get("e").and_then(Value::as_str) != Some("24hrTicker") {
        return None;
    }
    let symbol = value.get("s").and_then(Value::as_str)?;
    let price = value.get("c").and_then(Value::as_str)?;
    let volume = value.get("v").and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok());
    let change_pct = value.get("P").and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok());
    let high = value
        .get("h")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok());
    let low = value
        .get("l")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok());

    Some(Tick {
        symbol: Symbol::normalize(symbol),
        price: price.parse().ok()?,
        volume_24h: volume,
        change_pct_24h: change_pct,
        high_24h: high,
        low_24h: low,
        timestamp: chrono::Utc::now(),
    })
}
