//! Peer transport seam.
//!
//! A [`PeerTransport`] is one negotiated session to one remote peer
//! (an RTC peer connection in a browser, the in-memory pair in
//! [`crate::transport::memory`]). Transports report asynchronous
//! happenings as [`TransportEvent`]s on the sink handed to
//! [`TransportFactory::create`]; the manager drains that queue.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::CastError;
use crate::peer::PeerId;
use crate::signal::{IceCandidate, SessionDescription};
use crate::transport::channel::{ChannelOptions, DataChannel};

/// Connection state as reported by the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// What happened on a transport.
pub enum TransportEventKind {
    StateChanged(TransportState),
    /// A local candidate to relay to the remote side.
    IceCandidate(IceCandidate),
    /// The remote side opened a data channel.
    DataChannel(Box<dyn DataChannel>),
    ChannelOpen,
    ChannelClosed,
    /// One inbound data-channel message.
    Message(Bytes),
}

impl std::fmt::Debug for TransportEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.label()).finish(),
            Self::ChannelOpen => f.write_str("ChannelOpen"),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::Message(m) => write!(f, "Message({} bytes)", m.len()),
        }
    }
}

/// A transport event tagged with the remote peer it concerns.
#[derive(Debug)]
pub struct TransportEvent {
    pub peer: PeerId,
    pub kind: TransportEventKind,
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// One session to one remote peer.
#[async_trait]
pub trait PeerTransport: Send {
    /// Produce an offer (initiator side).
    async fn create_offer(&mut self) -> Result<SessionDescription, CastError>;

    /// Apply a remote offer and produce the answer (responder side).
    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription, CastError>;

    /// Apply the remote answer (initiator side).
    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), CastError>;

    /// Apply a candidate received from the remote side.
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CastError>;

    /// Open the media channel (initiator side, before the offer).
    fn open_data_channel(
        &mut self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Box<dyn DataChannel>, CastError>;

    fn close(&mut self);
}

/// Creates transports bound to one local identity.
pub trait TransportFactory: Send + Sync {
    fn create(&self, remote: &PeerId, events: TransportEventSender) -> Result<Box<dyn PeerTransport>, CastError>;
}
