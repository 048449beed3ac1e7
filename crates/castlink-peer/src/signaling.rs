//! WebSocket client for the relay.
//!
//! One task owns the socket. Envelopes queued on `outbound` are written as
//! text frames; decoded envelopes from the relay appear on `inbound`. The task
//! pings every `ping_interval` and gives up when a pong does not arrive
//! within `pong_timeout`. When it exits, `inbound` closes.

use castlink_common::{Envelope, Error, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;

const CHANNEL_CAPACITY: usize = 64;

pub struct SignalingChannel {
    pub outbound: mpsc::Sender<Envelope>,
    pub inbound: mpsc::Receiver<Envelope>,
    pub task: JoinHandle<()>,
}

pub async fn connect(config: &SignalingConfig) -> Result<SignalingChannel> {
    config.validate()?;
    let (ws, _) = timeout(config.connect_timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| Error::timeout(format!("connecting to {}", config.url)))?
        .map_err(|err| Error::closed(format!("relay {} unreachable: {}", config.url, err)))?;
    info!(url = %config.url, "connected to relay");

    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
    let ping_interval = config.ping_interval;
    let pong_timeout = config.pong_timeout;

    let task = tokio::spawn(async move {
        let (mut sink, mut stream) = ws.split();
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let waiting_for = pong_deadline;
            let deadline = async move {
                match waiting_for {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                envelope = out_rx.recv() => {
                    let Some(envelope) = envelope else {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    };
                    let text = match envelope.to_json() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("dropping unencodable envelope: {}", err);
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!("relay write failed: {}", err);
                        break;
                    }
                }
                _ = ping.tick() => {
                    if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                        warn!("relay ping failed: {}", err);
                        break;
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + pong_timeout);
                    }
                }
                _ = deadline => {
                    warn!("no pong from relay within {:?}, dropping connection", pong_timeout);
                    break;
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match Envelope::from_json(&text) {
                        Ok(envelope) => {
                            if in_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("ignoring envelope from relay: {}", err),
                    },
                    Some(Ok(Message::Pong(_))) => pong_deadline = None,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("relay read failed: {}", err);
                        break;
                    }
                },
            }
        }
        debug!("signaling task finished");
    });

    Ok(SignalingChannel {
        outbound: out_tx,
        inbound: in_rx,
        task,
    })
}
