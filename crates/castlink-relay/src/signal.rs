//! WebSocket endpoint: one read loop and one writer task per client.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use castlink_common::Envelope;
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::outbox::Outbox;
use crate::registry::ClientId;
use crate::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let max = state.config.max_message_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(stream: WebSocket, state: AppState, addr: SocketAddr) {
    let id = ClientId::new();
    let outbox = Arc::new(Outbox::new(
        state.config.outbox_capacity,
        state.config.overflow_policy,
    ));

    if state.relay.register(id, addr, outbox.clone()).await.is_err() {
        warn!(client = %id, %addr, "relay unavailable, dropping connection");
        return;
    }
    info!(client = %id, %addr, "client connected");

    let (mut sender, mut receiver) = stream.split();

    let writer_outbox = outbox.clone();
    let write_timeout = state.config.write_timeout;
    let mut writer = tokio::spawn(async move {
        while let Some(text) = writer_outbox.pop().await {
            match timeout(write_timeout, sender.send(Message::Text(text.to_string()))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(client = %id, "write failed: {}", err);
                    break;
                }
                Err(_) => {
                    warn!(client = %id, "write timed out after {:?}", write_timeout);
                    break;
                }
            }
        }
        writer_outbox.close();
        // a stalled peer would block the close handshake too
        let _ = timeout(write_timeout, sender.close()).await;
    });

    let idle_timeout = state.config.idle_timeout;
    let mut writer_done = false;

    loop {
        tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            next = timeout(idle_timeout, receiver.next()) => {
                let msg = match next {
                    Err(_) => {
                        info!(
                            client = %id,
                            "no traffic for {:?}, considering connection dead",
                            idle_timeout
                        );
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        debug!(client = %id, "read failed: {}", err);
                        break;
                    }
                    Ok(Some(Ok(msg))) => msg,
                };

                match msg {
                    Message::Text(text) => {
                        if !forward_envelope(&state, id, text).await {
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        warn!(client = %id, "binary frames are not envelopes, ignoring");
                    }
                    // axum queues the pong reply itself
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    let _ = state.relay.unregister(id).await;
    outbox.close();
    if !writer_done {
        let _ = writer.await;
    }
    info!(client = %id, %addr, "client disconnected");
}

/// Validates `text` as an envelope and hands it to the relay untouched.
///
/// Returns `false` only when the relay itself is gone.
async fn forward_envelope(state: &AppState, id: ClientId, text: String) -> bool {
    let envelope = match Envelope::from_json(&text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(client = %id, "rejecting envelope: {}", err);
            return true;
        }
    };
    let kind = envelope.kind();
    debug!(client = %id, %kind, bytes = text.len(), "envelope received");
    state.relay.publish(id, kind, text).await.is_ok()
}
