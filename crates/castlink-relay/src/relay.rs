//! Broadcast relay: the single owner of the client registry.
//!
//! All registry mutation and fan-out happens on one dispatch task fed by a
//! bounded command queue. Fan-out never waits on a client: each recipient's
//! [`Outbox`](crate::outbox::Outbox) absorbs or drops per its overflow policy.
//!
//! Envelopes are delivered to every registered client *except* the sender.

use std::net::SocketAddr;
use std::sync::Arc;

use castlink_common::{EnvelopeKind, Error, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::outbox::PushOutcome;
use crate::registry::{ClientId, ClientOutbox, ClientRegistry};

#[derive(Debug)]
enum RelayCommand {
    Register {
        id: ClientId,
        addr: SocketAddr,
        outbox: ClientOutbox,
    },
    Unregister {
        id: ClientId,
    },
    Publish {
        from: ClientId,
        kind: EnvelopeKind,
        text: Arc<str>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub clients: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped_messages: u64,
}

/// Cheap, cloneable entry point into the dispatch task.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    pub async fn register(
        &self,
        id: ClientId,
        addr: SocketAddr,
        outbox: ClientOutbox,
    ) -> Result<()> {
        self.send(RelayCommand::Register { id, addr, outbox }).await
    }

    pub async fn unregister(&self, id: ClientId) -> Result<()> {
        self.send(RelayCommand::Unregister { id }).await
    }

    /// Queue `text` (an already validated envelope) for every other client.
    pub async fn publish(
        &self,
        from: ClientId,
        kind: EnvelopeKind,
        text: impl Into<Arc<str>>,
    ) -> Result<()> {
        self.send(RelayCommand::Publish {
            from,
            kind,
            text: text.into(),
        })
        .await
    }

    pub async fn stats(&self) -> Result<RelayStats> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayCommand::Stats { reply }).await?;
        rx.await.map_err(|_| Error::closed("relay dispatch task stopped"))
    }

    async fn send(&self, cmd: RelayCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| Error::closed("relay dispatch task stopped"))
    }
}

/// Start the dispatch task. It runs until every [`RelayHandle`] is dropped.
pub fn spawn_relay(dispatch_capacity: usize) -> (RelayHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(dispatch_capacity.max(1));
    let task = tokio::spawn(run_dispatch(rx));
    (RelayHandle { tx }, task)
}

async fn run_dispatch(mut rx: mpsc::Receiver<RelayCommand>) {
    let mut registry = ClientRegistry::new();
    let mut stats = RelayStats::default();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RelayCommand::Register { id, addr, outbox } => {
                if registry.register(id, addr, outbox) {
                    info!(client = %id, %addr, clients = registry.len(), "client registered");
                } else {
                    debug!(client = %id, "client already registered");
                }
            }
            RelayCommand::Unregister { id } => {
                if let Some(entry) = registry.unregister(&id) {
                    info!(
                        client = %id,
                        addr = %entry.addr,
                        connected_for = ?entry.connected_at.elapsed(),
                        clients = registry.len(),
                        "client unregistered"
                    );
                }
            }
            RelayCommand::Publish { from, kind, text } => {
                stats.published += 1;
                let mut departed = Vec::new();
                for (id, entry) in registry.recipients(&from) {
                    match entry.outbox.push(text.clone()) {
                        PushOutcome::Queued => stats.delivered += 1,
                        PushOutcome::DroppedOldest => {
                            stats.delivered += 1;
                            stats.dropped_messages += 1;
                            warn!(
                                client = %id,
                                %kind,
                                "outbox full, dropped oldest queued envelope"
                            );
                        }
                        PushOutcome::DroppedNewest => {
                            stats.dropped_messages += 1;
                            warn!(client = %id, %kind, "outbox full, dropped envelope");
                        }
                        PushOutcome::Closed => departed.push(*id),
                    }
                }
                for id in departed {
                    if registry.unregister(&id).is_some() {
                        info!(client = %id, "client writer gone, unregistered");
                    }
                }
                debug!(
                    from = %from,
                    %kind,
                    recipients = registry.len().saturating_sub(1),
                    "envelope fanned out"
                );
            }
            RelayCommand::Stats { reply } => {
                stats.clients = registry.len();
                let _ = reply.send(stats);
            }
        }
    }

    registry.clear();
    debug!("relay dispatch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::outbox::Outbox;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    fn outbox(capacity: usize) -> ClientOutbox {
        Arc::new(Outbox::new(capacity, OverflowPolicy::DropNewest))
    }

    async fn next_text(outbox: &ClientOutbox) -> String {
        match tokio::time::timeout(Duration::from_secs(1), outbox.pop()).await {
            Ok(Some(text)) => text.to_string(),
            other => panic!("expected queued envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_everyone_but_sender() {
        let (relay, _task) = spawn_relay(16);
        let (a, b, c) = (ClientId::new(), ClientId::new(), ClientId::new());
        let (oa, ob, oc) = (outbox(8), outbox(8), outbox(8));
        relay.register(a, addr(), oa.clone()).await.unwrap();
        relay.register(b, addr(), ob.clone()).await.unwrap();
        relay.register(c, addr(), oc.clone()).await.unwrap();

        relay.publish(a, EnvelopeKind::Offer, "offer-1").await.unwrap();
        let stats = relay.stats().await.unwrap();

        assert_eq!(next_text(&ob).await, "offer-1");
        assert_eq!(next_text(&oc).await, "offer-1");
        assert!(oa.is_empty());
        assert!(ob.is_empty() && oc.is_empty());
        assert_eq!(stats.published, 1);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.clients, 3);
    }

    #[tokio::test]
    async fn test_per_client_fifo() {
        let (relay, _task) = spawn_relay(16);
        let (a, b) = (ClientId::new(), ClientId::new());
        let ob = outbox(8);
        relay.register(a, addr(), outbox(8)).await.unwrap();
        relay.register(b, addr(), ob.clone()).await.unwrap();
        for i in 0..5 {
            relay
                .publish(a, EnvelopeKind::Candidate, format!("c{i}"))
                .await
                .unwrap();
        }
        for i in 0..5 {
            assert_eq!(next_text(&ob).await, format!("c{i}"));
        }
    }

    #[tokio::test]
    async fn test_full_client_does_not_block_others() {
        let (relay, _task) = spawn_relay(16);
        let (a, slow, fast) = (ClientId::new(), ClientId::new(), ClientId::new());
        let slow_box = outbox(1);
        let fast_box = outbox(16);
        relay.register(a, addr(), outbox(1)).await.unwrap();
        relay.register(slow, addr(), slow_box.clone()).await.unwrap();
        relay.register(fast, addr(), fast_box.clone()).await.unwrap();

        for i in 0..4 {
            relay
                .publish(a, EnvelopeKind::Candidate, format!("c{i}"))
                .await
                .unwrap();
        }
        let stats = relay.stats().await.unwrap();

        assert_eq!(fast_box.len(), 4);
        assert_eq!(slow_box.len(), 1);
        assert_eq!(stats.dropped_messages, 3);
        assert_eq!(next_text(&slow_box).await, "c0");
    }

    #[tokio::test]
    async fn test_unregistered_client_never_targeted() {
        let (relay, _task) = spawn_relay(16);
        let (a, b) = (ClientId::new(), ClientId::new());
        let ob = outbox(8);
        relay.register(a, addr(), outbox(8)).await.unwrap();
        relay.register(b, addr(), ob.clone()).await.unwrap();
        relay.unregister(b).await.unwrap();
        relay.unregister(b).await.unwrap();
        relay.publish(a, EnvelopeKind::Offer, "late").await.unwrap();
        let stats = relay.stats().await.unwrap();

        assert!(ob.is_closed());
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn test_closed_outbox_is_unregistered_on_publish() {
        let (relay, _task) = spawn_relay(16);
        let (a, b) = (ClientId::new(), ClientId::new());
        let ob = outbox(8);
        relay.register(a, addr(), outbox(8)).await.unwrap();
        relay.register(b, addr(), ob.clone()).await.unwrap();
        ob.close();
        relay.publish(a, EnvelopeKind::Offer, "x").await.unwrap();
        assert_eq!(relay.stats().await.unwrap().clients, 1);
    }
}
