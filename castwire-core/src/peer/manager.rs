//! One transport session per remote peer, with the chunk transport
//! running over each session's media channel.
//!
//! The manager is the only owner of its session table. Every removal
//! goes through [`PeerConnectionManager::close_peer`] or a terminal
//! transport state, both of which close the channel and the transport,
//! drop the peer's reassembly state and publish [`PeerEvent::Closed`].
//! Subscribers obtained from [`subscribe`](PeerConnectionManager::subscribe)
//! all see every event, in order.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::ChunkConfig;
use crate::error::CastError;
use crate::peer::PeerId;
use crate::peer::state::PeerState;
use crate::peer::transport::{
    PeerTransport, TransportEvent, TransportEventKind, TransportEventSender, TransportFactory,
    TransportState,
};
use crate::signal::{IceCandidate, SessionDescription};
use crate::transport::channel::{ChannelOptions, DataChannel, MEDIA_CHANNEL_LABEL};
use crate::transport::chunk::ChunkTransport;

// ── PeerEvent ────────────────────────────────────────────────────

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport reported failure.
    Failed,
    /// The transport closed or disconnected.
    Closed,
    /// Torn down locally.
    Local,
}

/// Event surface exposed to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Connected(PeerId),
    /// The media channel to the peer is ready for [`send`](PeerConnectionManager::send).
    DataChannelOpen(PeerId),
    /// A fully reassembled message.
    Data { peer: PeerId, payload: Bytes },
    /// A local candidate to relay to `peer` through signaling.
    IceCandidate { peer: PeerId, candidate: IceCandidate },
    Closed { peer: PeerId, reason: CloseReason },
}

// ── PeerSession ──────────────────────────────────────────────────

struct PeerSession {
    transport: Box<dyn PeerTransport>,
    channel: Option<Box<dyn DataChannel>>,
    state: PeerState,
    /// We produced the offer for this session.
    initiator: bool,
}

impl PeerSession {
    fn channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }
}

// ── PeerConnectionManager ────────────────────────────────────────

pub struct PeerConnectionManager {
    factory: Arc<dyn TransportFactory>,
    channel_options: ChannelOptions,
    sessions: HashMap<PeerId, PeerSession>,
    chunks: ChunkTransport,
    events_tx: TransportEventSender,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    subscribers: Vec<mpsc::UnboundedSender<PeerEvent>>,
}

impl PeerConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, chunk: ChunkConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            channel_options: ChannelOptions::default(),
            sessions: HashMap::new(),
            chunks: ChunkTransport::new(chunk),
            events_tx,
            events_rx,
            subscribers: Vec::new(),
        }
    }

    /// Register a new listener for [`PeerEvent`]s.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn publish(&mut self, event: PeerEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ── Negotiation ──────────────────────────────────────────────

    /// Start a session to `peer` as initiator and return the offer to
    /// relay. An existing session to `peer` is torn down first.
    pub async fn create_offer(&mut self, peer: &PeerId) -> Result<SessionDescription, CastError> {
        self.close_peer(peer);

        let mut transport = self.factory.create(peer, self.events_tx.clone())?;
        let channel = transport.open_data_channel(MEDIA_CHANNEL_LABEL, self.channel_options)?;
        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        self.sessions.insert(
            peer.clone(),
            PeerSession {
                transport,
                channel: Some(channel),
                state: PeerState::Connecting,
                initiator: true,
            },
        );
        info!("created offer for {peer}");
        Ok(offer)
    }

    /// Start a session to `peer` as responder and return the answer.
    pub async fn handle_offer(
        &mut self,
        peer: &PeerId,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CastError> {
        self.close_peer(peer);

        let mut transport = self.factory.create(peer, self.events_tx.clone())?;
        let answer = match transport.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        self.sessions.insert(
            peer.clone(),
            PeerSession {
                transport,
                channel: None,
                state: PeerState::Connecting,
                initiator: false,
            },
        );
        info!("answered offer from {peer}");
        Ok(answer)
    }

    pub async fn handle_answer(&mut self, peer: &PeerId, answer: SessionDescription) -> Result<(), CastError> {
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| CastError::UnknownPeer(peer.clone()))?;
        session.transport.accept_answer(answer).await?;
        debug!("applied answer from {peer}");
        Ok(())
    }

    /// Apply a remote candidate. A candidate for a peer with no session
    /// is an error: it means signaling delivered it out of order.
    pub async fn add_ice_candidate(&mut self, peer: &PeerId, candidate: IceCandidate) -> Result<(), CastError> {
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| CastError::UnknownPeer(peer.clone()))?;
        session.transport.add_ice_candidate(candidate).await
    }

    // ── Data path ────────────────────────────────────────────────

    /// Send one logical message to `peer`. Returns its sequence number.
    pub fn send(&mut self, peer: &PeerId, payload: &[u8]) -> Result<u32, CastError> {
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| CastError::UnknownPeer(peer.clone()))?;
        let channel = session.channel.as_deref_mut().ok_or(CastError::ChannelNotOpen)?;
        self.chunks.send(channel, payload)
    }

    /// Send `payload` to every peer with an open channel. Returns the
    /// peers the message could not be delivered to.
    pub fn broadcast(&mut self, payload: &[u8]) -> Vec<(PeerId, CastError)> {
        let mut failures = Vec::new();
        for (peer, session) in self.sessions.iter_mut() {
            if !session.state.is_connected() {
                continue;
            }
            let Some(channel) = session.channel.as_deref_mut() else {
                continue;
            };
            if let Err(e) = self.chunks.send(channel, payload) {
                failures.push((peer.clone(), e));
            }
        }
        failures
    }

    /// Wait for the next event from any transport.
    pub async fn next_transport_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// Take the next queued transport event without waiting.
    pub fn try_next_transport_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Process one transport event. Events for peers without a session
    /// are ignored.
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), CastError> {
        let TransportEvent { peer, kind } = event;
        let Some(session) = self.sessions.get_mut(&peer) else {
            trace!("ignoring {kind:?} for unknown peer {peer}");
            return Ok(());
        };

        match kind {
            TransportEventKind::StateChanged(TransportState::Connected) => {
                if let Err(e) = session.state.mark_connected() {
                    debug!("{peer}: {e}");
                    return Ok(());
                }
                info!("peer {peer} connected");
                self.publish(PeerEvent::Connected(peer));
            }
            TransportEventKind::StateChanged(TransportState::Connecting) => {}
            TransportEventKind::StateChanged(TransportState::Failed) => {
                warn!("transport to {peer} failed");
                self.teardown(&peer, CloseReason::Failed);
                return Err(CastError::PeerTransportFailed(peer));
            }
            TransportEventKind::StateChanged(TransportState::Disconnected | TransportState::Closed) => {
                info!("transport to {peer} closed");
                self.teardown(&peer, CloseReason::Closed);
            }
            TransportEventKind::IceCandidate(candidate) => {
                self.publish(PeerEvent::IceCandidate { peer, candidate });
            }
            TransportEventKind::DataChannel(channel) => {
                debug!("{peer} opened data channel '{}'", channel.label());
                if let Some(mut old) = session.channel.replace(channel) {
                    old.close();
                }
            }
            TransportEventKind::ChannelOpen => {
                info!("data channel to {peer} open");
                self.publish(PeerEvent::DataChannelOpen(peer));
            }
            TransportEventKind::ChannelClosed => {
                info!("data channel to {peer} closed");
            }
            TransportEventKind::Message(raw) => match self.chunks.receive(&peer, raw) {
                Ok(Some(payload)) => self.publish(PeerEvent::Data { peer, payload }),
                Ok(None) => {}
                Err(e) => {
                    warn!("bad chunk record from {peer}: {e}");
                    return Err(e);
                }
            },
        }
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────

    fn teardown(&mut self, peer: &PeerId, reason: CloseReason) -> bool {
        let Some(mut session) = self.sessions.remove(peer) else {
            self.chunks.release_peer(peer);
            return false;
        };
        if let Some(mut channel) = session.channel.take() {
            channel.close();
        }
        session.transport.close();
        match reason {
            CloseReason::Failed => {
                let _ = session.state.mark_failed();
            }
            CloseReason::Closed | CloseReason::Local => session.state.close(),
        }
        self.chunks.release_peer(peer);
        debug!("peer {peer} torn down ({reason:?})");
        self.publish(PeerEvent::Closed {
            peer: peer.clone(),
            reason,
        });
        true
    }

    /// Close the session to `peer` and release everything held for it.
    /// Returns `false` when there was no session.
    pub fn close_peer(&mut self, peer: &PeerId) -> bool {
        self.teardown(peer, CloseReason::Local)
    }

    pub fn close_all(&mut self) {
        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.teardown(&peer, CloseReason::Local);
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Peers whose transport is connected.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn connection_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state.is_connected())
            .count()
    }

    pub fn state(&self, peer: &PeerId) -> Option<&PeerState> {
        self.sessions.get(peer).map(|s| &s.state)
    }

    /// Whether we sent an offer to `peer` that has not connected yet.
    pub fn has_pending_offer(&self, peer: &PeerId) -> bool {
        self.sessions
            .get(peer)
            .is_some_and(|s| s.initiator && !s.state.is_connected())
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Whether the media channel to `peer` is open.
    pub fn is_channel_open(&self, peer: &PeerId) -> bool {
        self.sessions.get(peer).is_some_and(PeerSession::channel_open)
    }

    pub fn chunk_transport(&self) -> &ChunkTransport {
        &self.chunks
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            if let Some(mut channel) = session.channel.take() {
                channel.close();
            }
            session.transport.close();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
