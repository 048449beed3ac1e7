//! Connected-client bookkeeping.
//!
//! The registry knows nothing about negotiation: a client is an id, an address
//! and an outbound queue. It is owned by the relay's dispatch task and never
//! shared, so it needs no locking of its own.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::outbox::Outbox;

/// Process-wide unique handle for one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form is enough to tell clients apart in logs
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Envelope texts queued for a client's socket writer, forwarded exactly as
/// the sender wrote them. Keepalive pongs are answered by the WebSocket layer
/// and never take a slot here.
pub type ClientOutbox = Arc<Outbox<Arc<str>>>;

#[derive(Debug)]
pub struct ClientEntry {
    pub addr: SocketAddr,
    pub outbox: ClientOutbox,
    pub connected_at: Instant,
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientEntry>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` (and leaves the existing entry alone) if `id` is
    /// already registered.
    pub fn register(&mut self, id: ClientId, addr: SocketAddr, outbox: ClientOutbox) -> bool {
        if self.clients.contains_key(&id) {
            return false;
        }
        self.clients.insert(
            id,
            ClientEntry {
                addr,
                outbox,
                connected_at: Instant::now(),
            },
        );
        true
    }

    /// Removes the client and closes its outbox so the writer task winds down.
    pub fn unregister(&mut self, id: &ClientId) -> Option<ClientEntry> {
        let entry = self.clients.remove(id)?;
        entry.outbox.close();
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Every registered client except `sender`.
    pub fn recipients<'a>(
        &'a self,
        sender: &'a ClientId,
    ) -> impl Iterator<Item = (&'a ClientId, &'a ClientEntry)> + 'a {
        self.clients.iter().filter(move |(id, _)| *id != sender)
    }

    pub fn clear(&mut self) {
        for (_, entry) in self.clients.drain() {
            entry.outbox.close();
        }
    }
}
