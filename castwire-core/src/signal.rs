//! Signaling contract with the external room relay.
//!
//! The relay is an addressed pub/sub bus: it tracks room membership and
//! forwards offer/answer/candidate envelopes between participants. This
//! module only defines the messages exchanged with it. Both directions
//! are JSON objects tagged by a kebab-case `type` field with camelCase
//! payload fields.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CastError;
use crate::peer::PeerId;

// ── Session negotiation payloads ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque session description produced by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate, relayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

// ── Room model ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomMode {
    /// One host shares, everyone else watches.
    #[default]
    Classic,
    /// Any participant may share; viewers pick whom to watch.
    Conference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomRole {
    Host,
    Viewer,
    Participant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: PeerId,
    pub is_sharing: bool,
}

// ── Relay → node ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalEvent {
    #[serde(rename_all = "camelCase")]
    Joined {
        role: RoomRole,
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        has_host: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<RoomMode>,
        #[serde(default)]
        participants: Vec<ParticipantInfo>,
    },
    ConferenceState {
        participants: Vec<ParticipantInfo>,
    },
    #[serde(rename_all = "camelCase")]
    RoomState {
        host_id: Option<PeerId>,
        viewer_count: u32,
    },
    HostJoined,
    HostLeft,
    #[serde(rename_all = "camelCase")]
    ViewerJoined {
        viewer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        participant_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        sender_id: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        sender_id: PeerId,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        sender_id: PeerId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    SharerStarted {
        sharer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    SharerStopped {
        sharer_id: PeerId,
    },
    /// A conference participant wants our stream.
    #[serde(rename_all = "camelCase")]
    PeerStreamRequested {
        viewer_id: PeerId,
    },
    /// A classic-mode viewer wants the host's stream.
    #[serde(rename_all = "camelCase")]
    StreamRequested {
        viewer_id: PeerId,
    },
    Error {
        message: String,
    },
}

// ── Node → relay ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalRequest {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        is_host: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<RoomMode>,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        target_id: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        target_id: PeerId,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target_id: PeerId,
        candidate: IceCandidate,
    },
    StartSharing,
    StopSharing,
    #[serde(rename_all = "camelCase")]
    RequestPeerStream {
        target_id: PeerId,
    },
    RequestStream,
}

impl SignalRequest {
    /// The participant an addressed request is relayed to.
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            SignalRequest::Offer { target_id, .. }
            | SignalRequest::Answer { target_id, .. }
            | SignalRequest::IceCandidate { target_id, .. }
            | SignalRequest::RequestPeerStream { target_id } => Some(target_id),
            _ => None,
        }
    }
}

// ── Outbox ───────────────────────────────────────────────────────

/// A request tagged with the participant that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: PeerId,
    pub request: SignalRequest,
}

/// Outbound signaling handle for one node.
///
/// Requests are queued as [`Envelope`]s; whatever carries them to the
/// relay (a websocket writer, [`LoopbackRelay`](crate::relay::LoopbackRelay))
/// reads the other end.
#[derive(Debug, Clone)]
pub struct SignalOutbox {
    from: PeerId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl SignalOutbox {
    pub fn new(from: PeerId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { from, tx }
    }

    /// Outbox plus the receiving end of its queue.
    pub fn channel(from: PeerId) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(from, tx), rx)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.from
    }

    pub fn send(&self, request: SignalRequest) -> Result<(), CastError> {
        self.tx
            .send(Envelope {
                from: self.from.clone(),
                request,
            })
            .map_err(|_| CastError::ChannelClosed)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_event_wire_shape() {
        let json = r#"{"type":"offer","senderId":"abc","offer":{"type":"offer","sdp":"v=0"}}"#;
        let event: SignalEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            SignalEvent::Offer {
                sender_id: PeerId::from("abc"),
                offer: SessionDescription::offer("v=0"),
            }
        );
    }

    #[test]
    fn candidate_request_uses_camel_case() {
        let req = SignalRequest::IceCandidate {
            target_id: PeerId::from("p2"),
            candidate: IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["targetId"], "p2");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(json["candidate"]["sdpMid"], "0");
    }

    #[test]
    fn unit_requests_carry_only_tag() {
        let json = serde_json::to_string(&SignalRequest::StartSharing).unwrap();
        assert_eq!(json, r#"{"type":"start-sharing"}"#);
    }

    #[test]
    fn joined_tolerates_missing_optionals() {
        let json = r#"{"type":"joined","role":"participant","roomId":"r1"}"#;
        let event: SignalEvent = serde_json::from_str(json).unwrap();
        match event {
            SignalEvent::Joined {
                role,
                participants,
                mode,
                ..
            } => {
                assert_eq!(role, RoomRole::Participant);
                assert!(participants.is_empty());
                assert!(mode.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn conference_state_participants() {
        let json = r#"{"type":"conference-state","participants":[{"id":"a","isSharing":true}]}"#;
        let event: SignalEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            SignalEvent::ConferenceState {
                participants: vec![ParticipantInfo {
                    id: PeerId::from("a"),
                    is_sharing: true,
                }],
            }
        );
    }

    #[test]
    fn outbox_tags_sender() {
        let (outbox, mut rx) = SignalOutbox::channel(PeerId::from("me"));
        outbox.send(SignalRequest::StartSharing).unwrap();
        let env = rx.try_recv().unwrap();
        assert_eq!(env.from, PeerId::from("me"));
        assert_eq!(env.request, SignalRequest::StartSharing);

        drop(rx);
        assert!(matches!(
            outbox.send(SignalRequest::StopSharing),
            Err(CastError::ChannelClosed)
        ));
    }

    #[test]
    fn request_target() {
        let req = SignalRequest::RequestPeerStream {
            target_id: PeerId::from("s"),
        };
        assert_eq!(req.target(), Some(&PeerId::from("s")));
        assert_eq!(SignalRequest::StopSharing.target(), None);
    }
}
