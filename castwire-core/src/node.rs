//! Node orchestrator: one participant's encode, transport and decode
//! paths wired to the signaling relay.
//!
//! [`CastNode`] owns the peer manager, the encode pipeline and the
//! decode pipeline. Every per-peer teardown goes through
//! [`CastNode::teardown_peer`], which cascades to the peer session,
//! its reassembly state and any decoder keyed by that peer.
//!
//! All work happens on the task that drives [`CastNode::run`] (or
//! [`CastNode::process_pending`] in tests); only the encoder pull loop
//! runs on its own task and hands records back through a queue.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::NodeSettings;
use crate::error::CastError;
use crate::media::backend::CodecBackend;
use crate::media::capture::FrameSource;
use crate::media::decoder::{DecodePipeline, DecodedOutput, DecoderStats};
use crate::media::encoder::{EncodePipeline, EncoderStats};
use crate::media::frame;
use crate::media::types::EncodedFrame;
use crate::peer::manager::{CloseReason, PeerConnectionManager, PeerEvent};
use crate::peer::transport::TransportFactory;
use crate::peer::PeerId;
use crate::signal::{RoomMode, RoomRole, SignalEvent, SignalOutbox, SignalRequest};

/// Encoded records buffered between the encoder task and the node.
const ENCODED_QUEUE: usize = 64;

pub struct CastNode {
    id: PeerId,
    settings: NodeSettings,
    outbox: SignalOutbox,
    peers: PeerConnectionManager,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    encoder: EncodePipeline,
    encoded_tx: mpsc::Sender<EncodedFrame>,
    encoded_rx: mpsc::Receiver<EncodedFrame>,
    decoder: DecodePipeline,
    decoded_tx: mpsc::UnboundedSender<DecodedOutput>,
    role: Option<RoomRole>,
    mode: RoomMode,
    sharing: bool,
    /// Peers receiving our stream.
    viewers: BTreeSet<PeerId>,
    /// Peers whose stream we decode.
    watching: BTreeSet<PeerId>,
    /// Viewers that asked before we started sharing.
    requested: BTreeSet<PeerId>,
}

impl CastNode {
    /// Build a node. Decoded frames from every watched sharer arrive on
    /// the returned receiver.
    pub fn new(
        settings: NodeSettings,
        backend: Arc<dyn CodecBackend>,
        factory: Arc<dyn TransportFactory>,
        outbox: SignalOutbox,
    ) -> (Self, mpsc::UnboundedReceiver<DecodedOutput>) {
        let mut peers = PeerConnectionManager::new(factory, settings.chunk.clone());
        let peer_events = peers.subscribe();
        let (encoded_tx, encoded_rx) = mpsc::channel(ENCODED_QUEUE);
        let (decoded_tx, decoded_rx) = mpsc::unbounded_channel();

        let node = Self {
            id: outbox.local_id().clone(),
            encoder: EncodePipeline::new(settings.encoder.clone(), Arc::clone(&backend)),
            decoder: DecodePipeline::new(settings.decode.clone(), backend),
            settings,
            outbox,
            peers,
            peer_events,
            encoded_tx,
            encoded_rx,
            decoded_tx,
            role: None,
            mode: RoomMode::default(),
            sharing: false,
            viewers: BTreeSet::new(),
            watching: BTreeSet::new(),
            requested: BTreeSet::new(),
        };
        (node, decoded_rx)
    }

    // ── Room ─────────────────────────────────────────────────────

    pub fn join_room(&mut self, room_id: impl Into<String>, mode: RoomMode, is_host: bool) -> Result<(), CastError> {
        self.mode = mode;
        self.outbox.send(SignalRequest::JoinRoom {
            room_id: room_id.into(),
            is_host,
            mode: Some(mode),
        })
    }

    // ── Sharing ──────────────────────────────────────────────────

    /// Start encoding `source` and serve every viewer that asks.
    pub async fn start_sharing(&mut self, source: Box<dyn FrameSource>) -> Result<(), CastError> {
        self.encoder.start(source, self.encoded_tx.clone()).await?;
        self.sharing = true;
        if self.mode == RoomMode::Conference {
            self.outbox.send(SignalRequest::StartSharing)?;
        }
        info!("{} started sharing", self.id);

        let waiting = std::mem::take(&mut self.requested);
        for viewer in waiting {
            if let Err(e) = self.serve_viewer(viewer.clone()).await {
                warn!("could not serve {viewer}: {e}");
            }
        }
        Ok(())
    }

    /// Stop encoding and drop every viewer session we do not also watch.
    /// Safe to call when not sharing.
    pub async fn stop_sharing(&mut self) -> Result<(), CastError> {
        self.encoder.stop().await;
        while self.encoded_rx.try_recv().is_ok() {}
        if !self.sharing {
            return Ok(());
        }
        self.sharing = false;

        let viewers = std::mem::take(&mut self.viewers);
        for viewer in viewers {
            if !self.watching.contains(&viewer) {
                self.peers.close_peer(&viewer);
            }
        }
        if self.mode == RoomMode::Conference {
            self.outbox.send(SignalRequest::StopSharing)?;
        }
        info!("{} stopped sharing", self.id);
        Ok(())
    }

    async fn serve_viewer(&mut self, viewer: PeerId) -> Result<(), CastError> {
        if viewer == self.id {
            return Ok(());
        }
        if !self.sharing {
            debug!("{viewer} asked for a stream before sharing started");
            self.requested.insert(viewer);
            return Ok(());
        }
        if self.peers.has_session(&viewer) {
            // One session per peer carries both directions.
            let open = self.peers.is_channel_open(&viewer);
            self.viewers.insert(viewer);
            if open {
                self.encoder.request_key_frame();
            }
            return Ok(());
        }

        let offer = self.peers.create_offer(&viewer).await?;
        self.viewers.insert(viewer.clone());
        self.outbox.send(SignalRequest::Offer {
            target_id: viewer,
            offer,
        })
    }

    // ── Watching ─────────────────────────────────────────────────

    /// Start decoding `sharer` and ask it for its stream.
    pub async fn watch(&mut self, sharer: PeerId) -> Result<(), CastError> {
        if sharer == self.id || self.watching.contains(&sharer) {
            return Ok(());
        }
        self.decoder
            .init_decoder(sharer.clone(), self.decoded_tx.clone())
            .await;
        self.watching.insert(sharer.clone());
        info!("{} watching {sharer}", self.id);
        match self.mode {
            RoomMode::Conference => self.outbox.send(SignalRequest::RequestPeerStream { target_id: sharer }),
            RoomMode::Classic => self.outbox.send(SignalRequest::RequestStream),
        }
    }

    /// Stop decoding `sharer`. The session stays up if we also serve it.
    pub async fn unwatch(&mut self, sharer: &PeerId) {
        if !self.watching.remove(sharer) {
            return;
        }
        self.decoder.stop_decoder(sharer).await;
        if !self.viewers.contains(sharer) {
            self.peers.close_peer(sharer);
        }
        info!("{} stopped watching {sharer}", self.id);
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Release everything held for `peer`: session, reassembly state,
    /// decoder and role bookkeeping.
    pub async fn teardown_peer(&mut self, peer: &PeerId) {
        self.peers.close_peer(peer);
        self.decoder.stop_decoder(peer).await;
        self.viewers.remove(peer);
        self.watching.remove(peer);
        self.requested.remove(peer);
        debug!("{} released {peer}", self.id);
    }

    /// Stop everything: encoder, decoders and sessions.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stop_sharing().await {
            debug!("stop sharing during shutdown: {e}");
        }
        self.decoder.stop_all().await;
        self.peers.close_all();
        self.viewers.clear();
        self.watching.clear();
        self.requested.clear();
    }

    // ── Inbound signaling ────────────────────────────────────────

    pub async fn handle_signal(&mut self, event: SignalEvent) -> Result<(), CastError> {
        match event {
            SignalEvent::Joined {
                role,
                room_id,
                has_host,
                mode,
                participants,
            } => {
                info!("{} joined room {room_id} as {role:?}", self.id);
                self.role = Some(role);
                if let Some(mode) = mode {
                    self.mode = mode;
                }
                if !self.settings.auto_watch {
                    return Ok(());
                }
                for p in participants {
                    if p.is_sharing {
                        self.watch(p.id).await?;
                    }
                }
                if role == RoomRole::Viewer && has_host == Some(true) {
                    self.outbox.send(SignalRequest::RequestStream)?;
                }
            }
            SignalEvent::ConferenceState { participants } => {
                trace!("{} conference state: {} participants", self.id, participants.len());
                if self.settings.auto_watch {
                    for p in participants {
                        if p.is_sharing {
                            self.watch(p.id).await?;
                        }
                    }
                }
            }
            SignalEvent::RoomState { host_id, viewer_count } => {
                trace!("{} room state: host {host_id:?}, {viewer_count} viewers", self.id);
            }
            SignalEvent::HostJoined => {
                if self.settings.auto_watch && self.role == Some(RoomRole::Viewer) {
                    self.outbox.send(SignalRequest::RequestStream)?;
                }
            }
            SignalEvent::HostLeft => {
                let watched: Vec<PeerId> = self.watching.iter().cloned().collect();
                for sharer in watched {
                    self.teardown_peer(&sharer).await;
                }
            }
            SignalEvent::ViewerJoined { viewer_id }
            | SignalEvent::StreamRequested { viewer_id }
            | SignalEvent::PeerStreamRequested { viewer_id } => {
                self.serve_viewer(viewer_id).await?;
            }
            SignalEvent::ParticipantLeft { participant_id } => {
                self.teardown_peer(&participant_id).await;
            }
            SignalEvent::Offer { sender_id, offer } => {
                // Both sides offered at once: the lower id keeps its own.
                if self.peers.has_pending_offer(&sender_id) && self.id < sender_id {
                    debug!("{} keeping own offer to {sender_id}", self.id);
                    return Ok(());
                }
                if !self.decoder.has_decoder(&sender_id) {
                    self.decoder
                        .init_decoder(sender_id.clone(), self.decoded_tx.clone())
                        .await;
                    self.watching.insert(sender_id.clone());
                }
                let answer = self.peers.handle_offer(&sender_id, offer).await?;
                self.outbox.send(SignalRequest::Answer {
                    target_id: sender_id,
                    answer,
                })?;
            }
            SignalEvent::Answer { sender_id, answer } => {
                self.peers.handle_answer(&sender_id, answer).await?;
            }
            SignalEvent::IceCandidate { sender_id, candidate } => {
                self.peers.add_ice_candidate(&sender_id, candidate).await?;
            }
            SignalEvent::SharerStarted { sharer_id } => {
                if self.settings.auto_watch {
                    self.watch(sharer_id).await?;
                }
            }
            SignalEvent::SharerStopped { sharer_id } => {
                self.unwatch(&sharer_id).await;
            }
            SignalEvent::Error { message } => {
                warn!("relay error for {}: {message}", self.id);
            }
        }
        Ok(())
    }

    // ── Peer events ──────────────────────────────────────────────

    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), CastError> {
        match event {
            PeerEvent::Connected(peer) => {
                debug!("{} connected to {peer}", self.id);
            }
            PeerEvent::DataChannelOpen(peer) => {
                if self.viewers.contains(&peer) {
                    info!("viewer {peer} attached to {}", self.id);
                    self.encoder.request_key_frame();
                }
            }
            PeerEvent::Data { peer, payload } => {
                if !self.decoder.has_decoder(&peer) {
                    trace!("{} ignoring media from unwatched {peer}", self.id);
                    return Ok(());
                }
                let record = frame::deserialize(&payload)?;
                self.decoder.decode(&peer, &record)?;
            }
            PeerEvent::IceCandidate { peer, candidate } => {
                self.outbox.send(SignalRequest::IceCandidate {
                    target_id: peer,
                    candidate,
                })?;
            }
            PeerEvent::Closed { reason: CloseReason::Local, .. } => {}
            PeerEvent::Closed { peer, reason } => {
                info!("{} lost {peer} ({reason:?})", self.id);
                self.teardown_peer(&peer).await;
            }
        }
        Ok(())
    }

    // ── Outbound media ───────────────────────────────────────────

    /// Serialize `record` once and send it to every viewer. Returns how
    /// many viewers it reached.
    pub fn on_encoded(&mut self, record: EncodedFrame) -> usize {
        let wire = frame::serialize(&record);
        let mut delivered = 0;
        let mut resync = false;
        let mut stale = Vec::new();

        for viewer in &self.viewers {
            match self.peers.send(viewer, &wire) {
                Ok(_) => delivered += 1,
                Err(CastError::ChannelNotOpen) => {}
                Err(e @ CastError::ChannelSaturated { .. }) => {
                    debug!("skipping {} for {viewer}: {e}", record.kind());
                    resync = true;
                }
                Err(CastError::UnknownPeer(_)) => stale.push(viewer.clone()),
                Err(e) => warn!("send to {viewer} failed: {e}"),
            }
        }
        for viewer in stale {
            self.viewers.remove(&viewer);
        }
        if resync {
            self.encoder.request_key_frame();
        }
        delivered
    }

    /// Send an application payload to every connected peer.
    pub fn broadcast(&mut self, payload: &[u8]) -> Vec<(PeerId, CastError)> {
        self.peers.broadcast(payload)
    }

    // ── Driving ──────────────────────────────────────────────────

    /// Run until `shutdown` fires, then release everything.
    pub async fn run(&mut self, signals: &mut mpsc::UnboundedReceiver<SignalEvent>, shutdown: CancellationToken) {
        info!("node {} running", self.id);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = signals.recv() => {
                    let result = self.handle_signal(event).await;
                    self.report(result);
                }
                Some(event) = self.peers.next_transport_event() => {
                    let result = self.peers.handle_transport_event(event);
                    self.report(result);
                }
                Some(event) = self.peer_events.recv() => {
                    let result = self.handle_peer_event(event).await;
                    self.report(result);
                }
                Some(record) = self.encoded_rx.recv() => {
                    self.on_encoded(record);
                }
                else => break,
            }
        }
        self.shutdown().await;
        info!("node {} stopped", self.id);
    }

    /// Handle everything already queued without waiting. Returns the
    /// number of items processed.
    pub async fn process_pending(&mut self, signals: &mut mpsc::UnboundedReceiver<SignalEvent>) -> usize {
        let mut handled = 0;
        loop {
            let before = handled;
            while let Ok(event) = signals.try_recv() {
                let result = self.handle_signal(event).await;
                self.report(result);
                handled += 1;
            }
            while let Some(event) = self.peers.try_next_transport_event() {
                let result = self.peers.handle_transport_event(event);
                self.report(result);
                handled += 1;
            }
            while let Ok(event) = self.peer_events.try_recv() {
                let result = self.handle_peer_event(event).await;
                self.report(result);
                handled += 1;
            }
            while let Ok(record) = self.encoded_rx.try_recv() {
                self.on_encoded(record);
                handled += 1;
            }
            if handled == before {
                return handled;
            }
        }
    }

    fn report(&self, result: Result<(), CastError>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_transient() => trace!("{}: {e}", self.id),
            Err(e) => warn!("{}: {e}", self.id),
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> Option<RoomRole> {
        self.role
    }

    pub fn is_sharing(&self) -> bool {
        self.sharing
    }

    pub fn viewers(&self) -> impl Iterator<Item = &PeerId> {
        self.viewers.iter()
    }

    pub fn watching(&self) -> impl Iterator<Item = &PeerId> {
        self.watching.iter()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.connected_peers()
    }

    pub fn connection_count(&self) -> usize {
        self.peers.connection_count()
    }

    pub fn encoder_stats(&self) -> EncoderStats {
        *self.encoder.stats_receiver().borrow()
    }

    pub fn decoder_stats(&self, sharer: &PeerId) -> Option<DecoderStats> {
        self.decoder.stats(sharer)
    }

    pub fn has_decoder(&self, sharer: &PeerId) -> bool {
        self.decoder.has_decoder(sharer)
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerConnectionManager {
        &mut self.peers
    }

    pub fn encoder(&self) -> &EncodePipeline {
        &self.encoder
    }
}

// ── Tests ────────────────────────────────────────────────────────
