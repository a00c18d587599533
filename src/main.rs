//! Paper-feed backend: upstream market-data consumer, price fan-out, and P&L
//! pipeline behind a client-facing WebSocket gateway.

use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use paperfeed_backend::broadcaster::spawn_flush_loop;
use paperfeed_backend::config::Config;
use paperfeed_backend::core::Core;
use paperfeed_backend::gateway::websocket_handler;
use paperfeed_backend::middleware::request_logging_simple;
use paperfeed_backend::store::{InMemoryPositionStore, InMemorySessionStore};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paperfeed_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn health_check(axum::extract::State(core): axum::extract::State<Arc<Core>>) -> impl axum::response::IntoResponse {
    if core.upstream.is_fatal() {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded: upstream feed unreachable")
    } else {
        (axum::http::StatusCode::OK, "ok")
    }
}

async fn metrics_handler(
    axum::extract::State(handle): axum::extract::State<metrics_exporter_prometheus::PrometheusHandle>,
) -> String {
    handle.render()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().context("loading configuration")?;

    let prometheus_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("installing prometheus recorder")?;

    // Demo stores: a real deployment wires these to its actual auth service and
    // trading database (see store.rs). The in-memory ones keep the binary
    // runnable standalone.
    let session_store: Arc<dyn paperfeed_backend::store::SessionStore> =
        Arc::new(InMemorySessionStore::new());
    let position_store: Arc<dyn paperfeed_backend::store::PositionStore> =
        Arc::new(InMemoryPositionStore::new());

    let (core, broadcaster) = Core::build(config.clone(), session_store, position_store);
    let flush_handle = spawn_flush_loop(broadcaster);

    let metrics_router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .with_state(core.clone())
        .merge(metrics_router)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging_simple));

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "paperfeed backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(core, flush_handle))
        .await
        .context("server error")?;

    Ok(())
}

/// Waits for ctrl-c, then stops every background task: the upstream consumer's
/// read loop, the flush timer, and every open session (closed with a normal-close
/// code rather than dropped by the process exiting out from under them).
async fn shutdown_signal(core: Arc<Core>, flush_handle: tokio::task::JoinHandle<()>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    core.upstream.shutdown();
    flush_handle.abort();
    core.sessions.close_all();
}
