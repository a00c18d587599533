//! Client-facing WebSocket gateway: session admission, the receive loop that
//! dispatches `ClientMessage`s, and the per-session writer task that drains
//! `SessionRegistry`'s outbound queue.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};

use crate::core::Core;
use crate::models::{ClientMessage, ServerMessage, SessionId, Symbol, UserId};
use crate::sessions::SessionFrame;

const CLOSE_UNAUTHORIZED: u16 = 4001;
const CLOSE_SESSION_LIMIT: u16 = 4000;
const CLOSE_NORMAL: u16 = 1000;

pub async fn websocket_handler(
    State(core): State<Arc<Core>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = token_from_query(&params).or_else(|| token_from_header(&headers));

    let Some(token) = token else {
        return ws.on_upgrade(move |socket| close_immediately(socket, CLOSE_UNAUTHORIZED, "missing credentials"));
    };

    ws.on_upgrade(move |socket| async move {
        match core.session_store.validate(&token).await {
            Some(user) => handle_socket(socket, core, user).await,
            None => close_immediately(socket, CLOSE_UNAUTHORIZED, "invalid session").await,
        }
    })
}

fn token_from_query(params: &HashMap<String, String>) -> Option<String> {
    params.get("session_id").cloned()
}

fn token_from_header(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ").map(|s| s.to_string())
}

async fn close_immediately(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, core: Arc<Core>, user: UserId) {
    let session = SessionId::new();

    if matches!(
        core.subscriptions.add_session(user, session),
        crate::subscription_index::AddSessionOutcome::RejectedMaxReached
    ) {
        close_immediately(socket, CLOSE_SESSION_LIMIT, "max sessions per user reached").await;
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<SessionFrame>(core.config.outbound_queue_capacity);
    core.sessions.register(session, user, tx);
    info!(%session, %user, "session connected");

    // Preload: the user's already-open positions determine the initial subscription
    // set, then an immediate portfolio snapshot gives the client something to render
    // before the first price tick arrives.
    match core.position_store.open_symbols_of(user).await {
        Ok(symbols) if !symbols.is_empty() => {
            let symbols: Vec<Symbol> = symbols.into_iter().collect();
            core.subscriptions.subscribe(user, &symbols);
            core.upstream.subscribe(symbols);
        }
        Ok(_) => {}
        Err(e) => warn!(%user, error = %e, "failed to preload open symbols"),
    }
    if let Ok(snapshot) = core.pnl_engine.recompute_now(user).await {
        let _ = core.sessions.send(session, ServerMessage::PortfolioSnapshot { data: snapshot });
    }

    let write_timeout = core.config.session_write_timeout;
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                SessionFrame::Message(message) => message,
                SessionFrame::Close => break,
            };
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            match tokio::time::timeout(write_timeout, sink.send(WsMessage::Text(text))).await {
                Ok(Ok(())) => {}
                _ => break,
            }
        }
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_NORMAL,
                reason: "server shutting down".into(),
            })))
            .await;
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => break,
        };
        match frame {
            WsMessage::Text(text) => dispatch(&core, user, session, &text).await,
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    core.sessions.remove(session);
    let orphaned = core.subscriptions.remove_session(user, session);
    if !orphaned.is_empty() {
        core.upstream.unsubscribe(orphaned.into_iter().collect());
    }
    info!(%session, %user, "session disconnected");
}

/// Distinguishes an unknown `type` (echoed back in the error message) from JSON
/// that doesn't even parse as an object with a `type` field.
fn error_message(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => match value.get("type").and_then(serde_json::Value::as_str) {
            Some(kind) => format!("unknown message type: {kind}"),
            None => "malformed message: missing \"type\" field".to_string(),
        },
        Err(_) => "malformed message: invalid json".to_string(),
    }
}

async fn dispatch(core: &Arc<Core>, user: UserId, session: SessionId, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => {
            let _ = core.sessions.send(session, ServerMessage::Error { message: error_message(text) });
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { symbols } => {
            let symbols: Vec<Symbol> = symbols.iter().map(|s| Symbol::normalize(s)).collect();
            core.subscriptions.subscribe(user, &symbols);
            core.upstream.subscribe(symbols.clone());
            let _ = core.sessions.send(
                session,
                ServerMessage::Subscribed {
                    symbols: symbols.into_iter().map(|s| s.0).collect(),
                },
            );
        }
        ClientMessage::Unsubscribe { symbols } => {
            let symbols: Vec<Symbol> = symbols.iter().map(|s| Symbol::normalize(s)).collect();
            let now_empty = core.subscriptions.unsubscribe(user, &symbols);
            if !now_empty.is_empty() {
                core.upstream.unsubscribe(now_empty.into_iter().collect());
            }
            let _ = core.sessions.send(
                session,
                ServerMessage::Unsubscribed {
                    symbols: symbols.into_iter().map(|s| s.0).collect(),
                },
            );
        }
        ClientMessage::GetPortfolio => match core.pnl_engine.recompute_now(user).await {
            Ok(snapshot) => {
                let _ = core.sessions.send(session, ServerMessage::PortfolioSnapshot { data: snapshot });
            }
            Err(e) => {
                warn!(%user, error = %e, "get_portfolio failed");
                let _ = core.sessions.send(
                    session,
                    ServerMessage::Error {
                        message: "failed to load portfolio".to_string(),
                    },
                );
            }
        },
        ClientMessage::Ping => {
            let _ = core.sessions.send(session, ServerMessage::Pong);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_from_query_reads_session_id_param() {
        let mut params = HashMap::new();
        params.insert("session_id".to_string(), "abc123".to_string());
        assert_eq!(token_from_query(&params), Some("abc123".to_string()));
    }

    #[test]
    fn token_from_header_strips_bearer_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(token_from_header(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn token_from_header_rejects_non_bearer_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert_eq!(token_from_header(&headers), None);
    }

    #[test]
    fn unknown_type_is_echoed_in_error_message() {
        let msg = error_message(r#"{"type":"close_all_positions"}"#);
        assert!(msg.contains("close_all_positions"));
    }

    #[test]
    fn invalid_json_does_not_panic_on_type_lookup() {
        let msg = error_message("not json at all");
        assert!(msg.contains("invalid json"));
    }
}
