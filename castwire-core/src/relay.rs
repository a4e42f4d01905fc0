//! Single-room signaling relay that runs in-process.
//!
//! Used by `castwire-node` and the integration tests in place of the
//! external relay service. It keeps just enough membership state to
//! answer joins, announce sharers and route addressed envelopes.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::peer::PeerId;
use crate::signal::{Envelope, ParticipantInfo, RoomMode, RoomRole, SignalEvent, SignalOutbox, SignalRequest};

struct Member {
    events: mpsc::UnboundedSender<SignalEvent>,
    joined: bool,
    sharing: bool,
}

pub struct LoopbackRelay {
    room_id: Option<String>,
    mode: RoomMode,
    host: Option<PeerId>,
    members: BTreeMap<PeerId, Member>,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Default for LoopbackRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRelay {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            room_id: None,
            mode: RoomMode::Classic,
            host: None,
            members: BTreeMap::new(),
            tx,
            rx,
        }
    }

    /// Attach a participant. Returns its outbox and the queue of events
    /// addressed to it. The participant still has to send `join-room`.
    pub fn connect(&mut self, id: PeerId) -> (SignalOutbox, mpsc::UnboundedReceiver<SignalEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        self.members.insert(
            id.clone(),
            Member {
                events,
                joined: false,
                sharing: false,
            },
        );
        (SignalOutbox::new(id, self.tx.clone()), rx)
    }

    /// Detach a participant and tell the room.
    pub fn disconnect(&mut self, id: &PeerId) {
        let Some(member) = self.members.remove(id) else {
            return;
        };
        if !member.joined {
            return;
        }
        match self.mode {
            RoomMode::Conference => {
                if member.sharing {
                    self.broadcast(None, SignalEvent::SharerStopped { sharer_id: id.clone() });
                }
                self.broadcast(None, SignalEvent::ParticipantLeft { participant_id: id.clone() });
                self.broadcast_conference_state();
            }
            RoomMode::Classic => {
                if self.host.as_ref() == Some(id) {
                    self.host = None;
                    self.broadcast(None, SignalEvent::HostLeft);
                } else {
                    self.broadcast(None, SignalEvent::ParticipantLeft { participant_id: id.clone() });
                }
            }
        }
    }

    fn deliver(&self, to: &PeerId, event: SignalEvent) {
        match self.members.get(to) {
            Some(member) => {
                if member.events.send(event).is_err() {
                    trace!("relay member {to} stopped listening");
                }
            }
            None => debug!("relay: no member {to}"),
        }
    }

    fn broadcast(&self, except: Option<&PeerId>, event: SignalEvent) {
        for (id, member) in &self.members {
            if member.joined && Some(id) != except {
                let _ = member.events.send(event.clone());
            }
        }
    }

    fn participants(&self) -> Vec<ParticipantInfo> {
        self.members
            .iter()
            .filter(|(_, m)| m.joined)
            .map(|(id, m)| ParticipantInfo {
                id: id.clone(),
                is_sharing: m.sharing,
            })
            .collect()
    }

    fn broadcast_conference_state(&self) {
        self.broadcast(
            None,
            SignalEvent::ConferenceState {
                participants: self.participants(),
            },
        );
    }

    fn viewer_count(&self) -> u32 {
        self.members
            .iter()
            .filter(|(id, m)| m.joined && self.host.as_ref() != Some(*id))
            .count() as u32
    }

    /// Apply one request.
    pub fn route(&mut self, envelope: Envelope) {
        let Envelope { from, request } = envelope;
        trace!("relay: {from} -> {request:?}");
        match request {
            SignalRequest::JoinRoom { room_id, is_host, mode } => {
                self.join(from, room_id, is_host, mode.unwrap_or_default());
            }
            SignalRequest::Offer { target_id, offer } => {
                self.deliver(&target_id, SignalEvent::Offer { sender_id: from, offer });
            }
            SignalRequest::Answer { target_id, answer } => {
                self.deliver(&target_id, SignalEvent::Answer { sender_id: from, answer });
            }
            SignalRequest::IceCandidate { target_id, candidate } => {
                self.deliver(&target_id, SignalEvent::IceCandidate { sender_id: from, candidate });
            }
            SignalRequest::StartSharing => self.set_sharing(from, true),
            SignalRequest::StopSharing => self.set_sharing(from, false),
            SignalRequest::RequestPeerStream { target_id } => {
                self.deliver(&target_id, SignalEvent::PeerStreamRequested { viewer_id: from });
            }
            SignalRequest::RequestStream => match self.host.clone() {
                Some(host) => self.deliver(&host, SignalEvent::StreamRequested { viewer_id: from }),
                None => debug!("relay: stream requested with no host"),
            },
        }
    }

    fn set_sharing(&mut self, from: PeerId, sharing: bool) {
        if self.mode != RoomMode::Conference {
            return;
        }
        let Some(member) = self.members.get_mut(&from) else {
            return;
        };
        if member.sharing == sharing {
            return;
        }
        member.sharing = sharing;
        let event = if sharing {
            SignalEvent::SharerStarted { sharer_id: from.clone() }
        } else {
            SignalEvent::SharerStopped { sharer_id: from.clone() }
        };
        self.broadcast(Some(&from), event);
        self.broadcast_conference_state();
    }

    fn join(&mut self, from: PeerId, room_id: String, is_host: bool, mode: RoomMode) {
        if self.room_id.is_none() {
            self.room_id = Some(room_id.clone());
            self.mode = mode;
        }
        let Some(member) = self.members.get_mut(&from) else {
            warn!("relay: join from unconnected {from}");
            return;
        };
        member.joined = true;

        match self.mode {
            RoomMode::Conference => {
                let participants = self.participants();
                self.deliver(
                    &from,
                    SignalEvent::Joined {
                        role: RoomRole::Participant,
                        room_id,
                        has_host: None,
                        mode: Some(RoomMode::Conference),
                        participants,
                    },
                );
                self.broadcast_conference_state();
            }
            RoomMode::Classic if is_host => {
                if self.host.as_ref().is_some_and(|h| *h != from) {
                    self.deliver(
                        &from,
                        SignalEvent::Error {
                            message: "room already has a host".into(),
                        },
                    );
                    return;
                }
                self.host = Some(from.clone());
                self.deliver(
                    &from,
                    SignalEvent::Joined {
                        role: RoomRole::Host,
                        room_id,
                        has_host: None,
                        mode: None,
                        participants: Vec::new(),
                    },
                );
                self.broadcast(Some(&from), SignalEvent::HostJoined);
                self.broadcast_room_state();
            }
            RoomMode::Classic => {
                self.deliver(
                    &from,
                    SignalEvent::Joined {
                        role: RoomRole::Viewer,
                        room_id,
                        has_host: Some(self.host.is_some()),
                        mode: None,
                        participants: Vec::new(),
                    },
                );
                if let Some(host) = self.host.clone() {
                    self.deliver(&host, SignalEvent::ViewerJoined { viewer_id: from });
                }
                self.broadcast_room_state();
            }
        }
    }

    fn broadcast_room_state(&self) {
        self.broadcast(
            None,
            SignalEvent::RoomState {
                host_id: self.host.clone(),
                viewer_count: self.viewer_count(),
            },
        );
    }

    /// Route every queued request. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            self.route(envelope);
            handled += 1;
        }
        handled
    }

    /// Route requests until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(envelope) = self.rx.recv() => self.route(envelope),
            }
        }
        debug!("relay stopped");
    }
}

// ── Tests ────────────────────────────────────────────────────────
