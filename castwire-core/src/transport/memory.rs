//! In-process transport used by the node runner and the tests.
//!
//! [`MemoryNetwork`] is a shared switchboard. Every node gets a
//! [`MemoryFactory`] for its own id; a transport pair becomes connected
//! once the initiator applies the responder's answer, exactly as an
//! RTC session would after offer/answer. Messages sent on one side's
//! [`MemoryChannel`] arrive as [`TransportEventKind::Message`] on the
//! other side's event queue, in send order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::CastError;
use crate::peer::PeerId;
use crate::peer::transport::{
    PeerTransport, TransportEvent, TransportEventKind, TransportEventSender, TransportFactory,
    TransportState,
};
use crate::signal::{IceCandidate, SdpType, SessionDescription};
use crate::transport::channel::{ChannelOptions, DataChannel, MEDIA_CHANNEL_LABEL};

// ── Switchboard ──────────────────────────────────────────────────

/// One side of a (local, remote) pair.
struct Endpoint {
    events: TransportEventSender,
    offered: bool,
    answered: bool,
    connected: bool,
    channel_open: bool,
    /// Simulated bytes queued on this side's channel.
    backlog: usize,
}

impl Endpoint {
    fn emit(&self, peer: &PeerId, kind: TransportEventKind) {
        let event = TransportEvent {
            peer: peer.clone(),
            kind,
        };
        if self.events.send(event).is_err() {
            trace!("memory endpoint event sink for {peer} dropped");
        }
    }
}

#[derive(Default)]
struct Switchboard {
    /// Keyed by `(local, remote)`.
    endpoints: HashMap<(PeerId, PeerId), Endpoint>,
}

type Shared = Arc<Mutex<Switchboard>>;

fn lock(shared: &Shared) -> MutexGuard<'_, Switchboard> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory network connecting every factory created from it.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    shared: Shared,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport factory for the node identified as `local`.
    pub fn factory(&self, local: impl Into<PeerId>) -> MemoryFactory {
        MemoryFactory {
            local: local.into(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Pretend `bytes` are queued on `local`'s channel towards `remote`.
    pub fn set_backlog(&self, local: &PeerId, remote: &PeerId, bytes: usize) {
        if let Some(ep) = lock(&self.shared)
            .endpoints
            .get_mut(&(local.clone(), remote.clone()))
        {
            ep.backlog = bytes;
        }
    }

    /// Whether `local` currently holds a connected transport to `remote`.
    pub fn is_connected(&self, local: &PeerId, remote: &PeerId) -> bool {
        lock(&self.shared)
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .is_some_and(|ep| ep.connected)
    }

    /// Live endpoints across the whole network.
    pub fn endpoint_count(&self) -> usize {
        lock(&self.shared).endpoints.len()
    }
}

// ── MemoryFactory ────────────────────────────────────────────────

pub struct MemoryFactory {
    local: PeerId,
    shared: Shared,
}

impl MemoryFactory {
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }
}

impl TransportFactory for MemoryFactory {
    fn create(&self, remote: &PeerId, events: TransportEventSender) -> Result<Box<dyn PeerTransport>, CastError> {
        if *remote == self.local {
            return Err(CastError::Negotiation("cannot connect to self".into()));
        }
        let key = (self.local.clone(), remote.clone());
        lock(&self.shared).endpoints.insert(
            key,
            Endpoint {
                events,
                offered: false,
                answered: false,
                connected: false,
                channel_open: false,
                backlog: 0,
            },
        );
        Ok(Box::new(MemoryTransport {
            local: self.local.clone(),
            remote: remote.clone(),
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }
}

// ── MemoryTransport ──────────────────────────────────────────────

pub struct MemoryTransport {
    local: PeerId,
    remote: PeerId,
    shared: Shared,
    closed: bool,
}

impl MemoryTransport {
    fn key(&self) -> (PeerId, PeerId) {
        (self.local.clone(), self.remote.clone())
    }

    fn remote_key(&self) -> (PeerId, PeerId) {
        (self.remote.clone(), self.local.clone())
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:memory {} {}", self.local, self.remote),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    fn ensure_open(&self) -> Result<(), CastError> {
        if self.closed {
            return Err(CastError::PeerTransportClosed(self.remote.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&mut self) -> Result<SessionDescription, CastError> {
        self.ensure_open()?;
        let candidate = self.local_candidate();
        let mut board = lock(&self.shared);
        let ep = board
            .endpoints
            .get_mut(&self.key())
            .ok_or_else(|| CastError::PeerTransportClosed(self.remote.clone()))?;
        ep.offered = true;
        ep.emit(&self.remote, TransportEventKind::StateChanged(TransportState::Connecting));
        ep.emit(&self.remote, TransportEventKind::IceCandidate(candidate));
        Ok(SessionDescription::offer(format!("memory-offer {}", self.local)))
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription, CastError> {
        self.ensure_open()?;
        if offer.sdp_type != SdpType::Offer {
            return Err(CastError::Negotiation("expected an offer".into()));
        }
        let candidate = self.local_candidate();
        let mut board = lock(&self.shared);
        let offered = board
            .endpoints
            .get(&self.remote_key())
            .is_some_and(|ep| ep.offered);
        if !offered {
            return Err(CastError::Negotiation(format!("no pending offer from {}", self.remote)));
        }
        let ep = board
            .endpoints
            .get_mut(&self.key())
            .ok_or_else(|| CastError::PeerTransportClosed(self.remote.clone()))?;
        ep.answered = true;
        ep.emit(&self.remote, TransportEventKind::StateChanged(TransportState::Connecting));
        ep.emit(&self.remote, TransportEventKind::IceCandidate(candidate));
        Ok(SessionDescription::answer(format!("memory-answer {}", self.local)))
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), CastError> {
        self.ensure_open()?;
        if answer.sdp_type != SdpType::Answer {
            return Err(CastError::Negotiation("expected an answer".into()));
        }
        let mut board = lock(&self.shared);
        let offered = board.endpoints.get(&self.key()).is_some_and(|ep| ep.offered);
        let answered = board
            .endpoints
            .get(&self.remote_key())
            .is_some_and(|ep| ep.answered);
        if !offered || !answered {
            return Err(CastError::Negotiation(format!(
                "answer from {} does not match a pending offer",
                self.remote
            )));
        }

        for key in [self.key(), self.remote_key()] {
            if let Some(ep) = board.endpoints.get_mut(&key) {
                ep.connected = true;
                ep.channel_open = true;
            }
        }
        if let Some(ep) = board.endpoints.get(&self.key()) {
            ep.emit(&self.remote, TransportEventKind::StateChanged(TransportState::Connected));
            ep.emit(&self.remote, TransportEventKind::ChannelOpen);
        }
        if let Some(ep) = board.endpoints.get(&self.remote_key()) {
            let channel = MemoryChannel {
                label: MEDIA_CHANNEL_LABEL.to_string(),
                local: self.remote.clone(),
                remote: self.local.clone(),
                shared: Arc::clone(&self.shared),
            };
            ep.emit(&self.local, TransportEventKind::StateChanged(TransportState::Connected));
            ep.emit(&self.local, TransportEventKind::DataChannel(Box::new(channel)));
            ep.emit(&self.local, TransportEventKind::ChannelOpen);
        }
        debug!("memory link {} <-> {} connected", self.local, self.remote);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CastError> {
        self.ensure_open()?;
        if candidate.candidate.is_empty() {
            return Err(CastError::Negotiation("empty candidate".into()));
        }
        trace!("{} applied candidate from {}", self.local, self.remote);
        Ok(())
    }

    fn open_data_channel(
        &mut self,
        label: &str,
        _options: ChannelOptions,
    ) -> Result<Box<dyn DataChannel>, CastError> {
        self.ensure_open()?;
        Ok(Box::new(MemoryChannel {
            label: label.to_string(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut board = lock(&self.shared);
        board.endpoints.remove(&self.key());
        if let Some(ep) = board.endpoints.get_mut(&self.remote_key()) {
            let was_connected = ep.connected;
            ep.connected = false;
            ep.channel_open = false;
            if was_connected {
                ep.emit(&self.local, TransportEventKind::ChannelClosed);
                ep.emit(&self.local, TransportEventKind::StateChanged(TransportState::Closed));
            }
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ── MemoryChannel ────────────────────────────────────────────────

pub struct MemoryChannel {
    label: String,
    local: PeerId,
    remote: PeerId,
    shared: Shared,
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        lock(&self.shared)
            .endpoints
            .get(&(self.local.clone(), self.remote.clone()))
            .is_some_and(|ep| ep.channel_open)
    }

    fn buffered_amount(&self) -> usize {
        lock(&self.shared)
            .endpoints
            .get(&(self.local.clone(), self.remote.clone()))
            .map_or(0, |ep| ep.backlog)
    }

    fn send(&mut self, message: Bytes) -> Result<(), CastError> {
        let board = lock(&self.shared);
        let open = board
            .endpoints
            .get(&(self.local.clone(), self.remote.clone()))
            .is_some_and(|ep| ep.channel_open);
        if !open {
            return Err(CastError::ChannelNotOpen);
        }
        let remote = board
            .endpoints
            .get(&(self.remote.clone(), self.local.clone()))
            .ok_or(CastError::ChannelClosed)?;
        remote
            .events
            .send(TransportEvent {
                peer: self.local.clone(),
                kind: TransportEventKind::Message(message),
            })
            .map_err(|_| CastError::ChannelClosed)
    }

    fn close(&mut self) {
        let mut board = lock(&self.shared);
        let was_open = board
            .endpoints
            .get_mut(&(self.local.clone(), self.remote.clone()))
            .map(|ep| std::mem::replace(&mut ep.channel_open, false))
            .unwrap_or(false);
        if let Some(ep) = board
            .endpoints
            .get_mut(&(self.remote.clone(), self.local.clone()))
        {
            ep.channel_open = false;
            if was_open {
                ep.emit(&self.local, TransportEventKind::ChannelClosed);
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    struct Side {
        transport: Box<dyn PeerTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn side(net: &MemoryNetwork, local: &str, remote: &str) -> Side {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = net.factory(local).create(&PeerId::from(remote), tx).unwrap();
        Side {
            transport,
            events: rx,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    async fn connect(net: &MemoryNetwork) -> (Side, Box<dyn DataChannel>, Side) {
        let mut a = side(net, "a", "b");
        let mut b = side(net, "b", "a");
        let ch = a
            .transport
            .open_data_channel(MEDIA_CHANNEL_LABEL, ChannelOptions::default())
            .unwrap();
        let offer = a.transport.create_offer().await.unwrap();
        let answer = b.transport.accept_offer(offer).await.unwrap();
        a.transport.accept_answer(answer).await.unwrap();
        (a, ch, b)
    }

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let net = MemoryNetwork::new();
        let (mut a, ch, mut b) = connect(&net).await;
        assert!(ch.is_open());
        assert!(net.is_connected(&PeerId::from("a"), &PeerId::from("b")));

        let a_events = drain(&mut a.events);
        assert!(a_events.iter().any(|e| matches!(e.kind, TransportEventKind::IceCandidate(_))));
        assert!(a_events.iter().any(|e| matches!(
            e.kind,
            TransportEventKind::StateChanged(TransportState::Connected)
        )));

        let b_events = drain(&mut b.events);
        assert!(b_events.iter().all(|e| e.peer == PeerId::from("a")));
        assert!(b_events.iter().any(|e| matches!(e.kind, TransportEventKind::DataChannel(_))));
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let net = MemoryNetwork::new();
        let (_a, mut ch, mut b) = connect(&net).await;
        drain(&mut b.events);

        for i in 0..5u8 {
            ch.send(Bytes::from(vec![i])).unwrap();
        }
        let got: Vec<u8> = drain(&mut b.events)
            .into_iter()
            .filter_map(|e| match e.kind {
                TransportEventKind::Message(m) => Some(m[0]),
                _ => None,
            })
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn answer_without_offer_is_rejected() {
        let net = MemoryNetwork::new();
        let mut b = side(&net, "b", "a");
        let err = b
            .transport
            .accept_offer(SessionDescription::offer("memory-offer a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::Negotiation(_)));
    }

    #[tokio::test]
    async fn close_notifies_remote_and_frees_endpoint() {
        let net = MemoryNetwork::new();
        let (mut a, ch, mut b) = connect(&net).await;
        drain(&mut b.events);

        a.transport.close();
        assert!(!ch.is_open());
        let b_events = drain(&mut b.events);
        assert!(b_events.iter().any(|e| matches!(
            e.kind,
            TransportEventKind::StateChanged(TransportState::Closed)
        )));
        assert_eq!(net.endpoint_count(), 1);

        b.transport.close();
        assert_eq!(net.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn backlog_is_reported() {
        let net = MemoryNetwork::new();
        let (_a, ch, _b) = connect(&net).await;
        net.set_backlog(&PeerId::from("a"), &PeerId::from("b"), 1234);
        assert_eq!(ch.buffered_amount(), 1234);
    }
}
