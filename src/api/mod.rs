// HTTP server wiring: proxy routes, control plane, CORS, graceful shutdown.

use anyhow::Result;
use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};

pub mod debug;
mod handlers;

static SERVER_HANDLE: OnceCell<RwLock<Option<oneshot::Sender<()>>>> = OnceCell::new();

pub fn build_router() -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::root))
        .route("/v1/models", get(handlers::models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/messages", post(handlers::messages))
        .route("/v1/responses", post(handlers::responses))
        // Control plane
        .route("/debug/health", get(debug::health))
        .route("/debug/logs", get(debug::logs))
        .route("/debug/stats", get(debug::stats))
        .route("/debug/tokens", get(debug::tokens))
        .route("/debug/models", get(debug::models))
        .route("/debug/switch", post(debug::switch))
        .route("/debug/router", get(debug::router_state).post(debug::router_action))
        .route("/debug/compare", post(debug::compare))
        .route("/debug/history", get(debug::history))
        .route("/debug/history/:id", get(debug::history_entry))
        .route("/debug/analytics", get(debug::analytics))
        // `/{backend}/…` forces routing to a named backend.
        .route("/*path", post(handlers::forced_proxy))
        .layer(cors)
}

pub async fn start_server() -> Result<()> {
    let config = crate::config::get_config().unwrap_or_default();
    let host = if config.host.is_empty() { "0.0.0.0" } else { &config.host };
    let addr = format!("{}:{}", host, config.port);

    debug::mark_started();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Gateway listening on {}", addr);

    let (tx, rx) = oneshot::channel::<()>();
    SERVER_HANDLE
        .get_or_init(|| RwLock::new(None))
        .write()
        .replace(tx);

    axum::serve(listener, build_router())
        .with_graceful_shutdown(async {
            rx.await.ok();
        })
        .await?;

    // Shutdown path: the router history is the only state worth flushing.
    if let Err(e) = crate::router::history::persist() {
        tracing::warn!("Router history persist on shutdown failed: {}", e);
    }
    Ok(())
}

pub async fn stop_server() -> Result<()> {
    if let Some(lock) = SERVER_HANDLE.get() {
        if let Some(tx) = lock.write().take() {
            let _ = tx.send(());
            tracing::info!("Gateway stopped");
        }
    }
    Ok(())
}

pub fn is_server_running() -> bool {
    SERVER_HANDLE
        .get()
        .map(|lock| lock.read().is_some())
        .unwrap_or(false)
}
