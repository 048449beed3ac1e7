//! castlink signaling relay.
//!
//! A dumb fan-out: every envelope received from one WebSocket client is
//! delivered to all other connected clients. The relay has no notion of
//! agent or viewer; negotiation lives entirely in the peers.

#![forbid(unsafe_code)]

pub mod config;
pub mod outbox;
pub mod registry;
pub mod relay;
pub mod signal;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::Method, response::IntoResponse, routing::get, Json, Router};
use castlink_common::{Error, Result};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub use config::{OverflowPolicy, RelayConfig};
pub use relay::{spawn_relay, RelayHandle, RelayStats};

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayHandle,
    pub config: Arc<RelayConfig>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.relay.stats().await {
        Ok(stats) => (axum::http::StatusCode::OK, Json(stats)).into_response(),
        Err(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS]);

    Router::new()
        .route("/", get(|| async { "castlink relay online" }))
        .route("/health", get(health))
        .route(&state.config.signal_path, get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the relay on an already bound listener until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    config: RelayConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;
    let (relay, _dispatch) = spawn_relay(config.dispatch_capacity);
    let state = AppState {
        relay,
        config: Arc::new(config),
    };

    let bound = listener.local_addr()?;
    info!(
        "relay listening on ws://{}{}",
        bound, state.config.signal_path
    );

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(Error::from)
}

pub async fn serve(listener: TcpListener, config: RelayConfig) -> Result<()> {
    serve_with_shutdown(listener, config, std::future::pending()).await
}
