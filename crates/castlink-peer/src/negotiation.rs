//! Per-connection offer/answer state machine.
//!
//! One [`NegotiationSession`] exists per logical peer connection on each
//! side. It consumes envelopes arriving from the relay, drives the
//! [`PeerTransport`], and emits envelopes for the relay on `outbound`.
//!
//! A transition that needs a transport call only commits once that call
//! succeeded; on failure the state is left as it was and the error is
//! returned to the driver, which then fails the session.

use std::future::Future;

use castlink_common::{Envelope, IceCandidate, SdpType, SessionDescription};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::transport::{ConnectionState, PeerTransport, TransportEvent};

/// Which end of the session this process plays. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Agent => f.write_str("agent"),
            Role::Viewer => f.write_str("viewer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    LocalOfferSet,
    RemoteDescriptionSet,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::LocalOfferSet => "local-offer-set",
            SessionState::RemoteDescriptionSet => "remote-description-set",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The remote side sent something this state cannot accept.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A transport call failed; the transition was not committed.
    #[error(transparent)]
    Transport(#[from] castlink_common::Error),

    #[error("session already {0}")]
    Terminated(SessionState),

    #[error("signaling channel closed")]
    SignalingClosed,
}

pub type NegotiationResult<T> = std::result::Result<T, NegotiationError>;

pub struct NegotiationSession<T: PeerTransport> {
    role: Role,
    transport: T,
    state: SessionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    outbound: mpsc::Sender<Envelope>,
    state_tx: watch::Sender<SessionState>,
}

impl<T: PeerTransport> NegotiationSession<T> {
    pub fn new(role: Role, transport: T, outbound: mpsc::Sender<Envelope>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::New);
        Self {
            role,
            transport,
            state: SessionState::New,
            local_description: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            outbound,
            state_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Watch the session state; the capture pipeline gates on this.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    fn commit(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        info!(role = %self.role, from = %self.state, to = %next, "session transition");
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn ensure_live(&self) -> NegotiationResult<()> {
        if self.state.is_terminal() {
            return Err(NegotiationError::Terminated(self.state));
        }
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> NegotiationResult<()> {
        let kind = envelope.kind();
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| NegotiationError::SignalingClosed)?;
        debug!(role = %self.role, %kind, "envelope sent");
        Ok(())
    }

    /// Create the local offer and send it. Only valid from `New`.
    pub async fn start_offer(&mut self) -> NegotiationResult<()> {
        self.ensure_live()?;
        if self.state != SessionState::New {
            return Err(NegotiationError::ProtocolViolation(format!(
                "cannot create an offer in state {}",
                self.state
            )));
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;

        self.local_description = Some(offer.clone());
        self.commit(SessionState::LocalOfferSet);
        self.publish(Envelope::Description(offer)).await
    }

    /// Apply one envelope received from the relay.
    pub async fn handle_envelope(&mut self, envelope: Envelope) -> NegotiationResult<()> {
        self.ensure_live()?;
        match envelope {
            Envelope::Description(desc) => match desc.sdp_type {
                SdpType::Offer => self.handle_offer(desc).await,
                SdpType::Answer => self.handle_answer(desc).await,
            },
            Envelope::Candidate(candidate) => self.handle_candidate(candidate).await,
        }
    }

    async fn handle_offer(&mut self, offer: SessionDescription) -> NegotiationResult<()> {
        if self.state != SessionState::New {
            return Err(NegotiationError::ProtocolViolation(format!(
                "offer received in state {}",
                self.state
            )));
        }

        self.transport.set_remote_description(offer.clone()).await?;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;

        self.remote_description = Some(offer);
        self.local_description = Some(answer.clone());
        self.commit(SessionState::RemoteDescriptionSet);

        self.publish(Envelope::Description(answer)).await?;
        self.flush_pending().await;
        Ok(())
    }

    async fn handle_answer(&mut self, answer: SessionDescription) -> NegotiationResult<()> {
        if self.state != SessionState::LocalOfferSet {
            return Err(NegotiationError::ProtocolViolation(format!(
                "answer received in state {}",
                self.state
            )));
        }

        self.transport.set_remote_description(answer.clone()).await?;

        self.remote_description = Some(answer);
        self.commit(SessionState::RemoteDescriptionSet);
        self.flush_pending().await;
        Ok(())
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) -> NegotiationResult<()> {
        if self.remote_description.is_none() {
            debug!(
                role = %self.role,
                pending = self.pending_candidates.len() + 1,
                "buffering candidate until remote description is set"
            );
            self.pending_candidates.push(candidate);
            return Ok(());
        }

        self.transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|err| {
                NegotiationError::ProtocolViolation(format!("candidate rejected: {}", err))
            })
    }

    /// Replay buffered candidates in arrival order. A rejected candidate is
    /// logged and skipped; the rest are still applied.
    async fn flush_pending(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        debug!(role = %self.role, count = pending.len(), "applying buffered candidates");
        for candidate in pending {
            if let Err(err) = self.transport.add_ice_candidate(candidate).await {
                warn!(role = %self.role, "buffered candidate rejected: {}", err);
            }
        }
    }

    /// React to a notification from the transport library.
    pub async fn handle_transport_event(
        &mut self,
        event: TransportEvent,
    ) -> NegotiationResult<()> {
        self.ensure_live()?;
        match event {
            TransportEvent::CandidateDiscovered(candidate) => {
                self.publish(Envelope::Candidate(candidate)).await?;
            }
            TransportEvent::GatheringComplete => {
                debug!(role = %self.role, "candidate gathering complete");
            }
            TransportEvent::StateChanged(ConnectionState::Connected) => {
                if self.state == SessionState::RemoteDescriptionSet {
                    self.commit(SessionState::Connected);
                } else {
                    debug!(role = %self.role, state = %self.state, "connected event ignored");
                }
            }
            TransportEvent::StateChanged(ConnectionState::Failed) => {
                self.fail().await;
            }
            TransportEvent::StateChanged(ConnectionState::Closed) => {
                self.close().await;
            }
            TransportEvent::StateChanged(other) => {
                debug!(role = %self.role, "transport state {:?}", other);
            }
        }
        Ok(())
    }

    async fn release(&mut self) {
        self.pending_candidates.clear();
        if let Err(err) = self.transport.close().await {
            debug!(role = %self.role, "transport close failed: {}", err);
        }
    }

    /// Move to `Failed` and release the transport. No-op once terminal.
    pub async fn fail(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.release().await;
        self.commit(SessionState::Failed);
    }

    /// Move to `Closed` and release the transport. No-op once terminal.
    pub async fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.release().await;
        self.commit(SessionState::Closed);
    }

    fn report(&self, err: &NegotiationError) {
        match err {
            NegotiationError::ProtocolViolation(msg) => {
                warn!(role = %self.role, state = %self.state, "rejected: {}", msg);
            }
            NegotiationError::Transport(err) => {
                error!(role = %self.role, state = %self.state, "transport failure: {}", err);
            }
            NegotiationError::Terminated(_) | NegotiationError::SignalingClosed => {
                debug!(role = %self.role, "{}", err);
            }
        }
    }

    async fn settle(&mut self, result: NegotiationResult<()>) {
        let Err(err) = result else {
            return;
        };
        self.report(&err);
        match err {
            NegotiationError::ProtocolViolation(_) | NegotiationError::Terminated(_) => {}
            NegotiationError::Transport(_) => self.fail().await,
            NegotiationError::SignalingClosed => self.close().await,
        }
    }

    /// Drive the session until it is terminal, the signaling channel closes,
    /// or `shutdown` resolves. Returns the final state.
    pub async fn run<F>(
        &mut self,
        inbound: &mut mpsc::Receiver<Envelope>,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: F,
    ) -> SessionState
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut events_open = true;

        while !self.state.is_terminal() {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(role = %self.role, "shutdown requested, closing session");
                    self.close().await;
                }
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => {
                        let result = self.handle_envelope(envelope).await;
                        self.settle(result).await;
                    }
                    None => {
                        info!(role = %self.role, "signaling channel closed");
                        self.close().await;
                    }
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        let result = self.handle_transport_event(event).await;
                        self.settle(result).await;
                    }
                    None => events_open = false,
                },
            }
        }

        self.state
    }
}
