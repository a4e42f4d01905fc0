//! Domain-specific error types for the castwire media layer.
//!
//! All fallible operations return `Result<T, CastError>`.
//! Every failure is scoped to one peer id, source id or message
//! sequence; nothing here is allowed to take down the process.

use thiserror::Error;

use crate::peer::PeerId;

/// The canonical error type for the media transport and codec pipeline.
#[derive(Debug, Error)]
pub enum CastError {
    // ── Wire Errors ──────────────────────────────────────────────
    /// A serialized media frame has an inconsistent header or length.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// A chunk/complete record could not be parsed or reassembled.
    #[error("malformed chunk message: {0}")]
    MalformedMessage(&'static str),

    /// The payload does not fit the chunk numbering space.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Codec Errors ─────────────────────────────────────────────
    /// Video was submitted before the decoder received a config.
    #[error("decoder not ready: no configuration applied")]
    DecoderNotReady,

    /// A config frame is missing its codec or dimensions.
    #[error("invalid decoder configuration: {0}")]
    DecoderConfigInvalid(&'static str),

    /// The codec backend cannot handle the requested codec string.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// The encoder or decoder backend reported a failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// The encoder's pending-work queue is above the saturation threshold.
    #[error("encode queue saturated ({depth} pending)")]
    EncodeQueueSaturated { depth: usize },

    // ── Channel Errors ───────────────────────────────────────────
    /// The data channel is not (or no longer) open.
    #[error("data channel not open")]
    ChannelNotOpen,

    /// The data channel has too many bytes queued; retry later.
    #[error("data channel saturated: {buffered} bytes buffered (max {max})")]
    ChannelSaturated { buffered: usize, max: usize },

    /// An internal mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Peer Errors ──────────────────────────────────────────────
    /// No session exists for the addressed peer id.
    #[error("no session for peer {0}")]
    UnknownPeer(PeerId),

    /// The transport to a peer failed.
    #[error("transport to peer {0} failed")]
    PeerTransportFailed(PeerId),

    /// The transport to a peer was closed.
    #[error("transport to peer {0} closed")]
    PeerTransportClosed(PeerId),

    /// A peer session was asked to make an illegal state transition.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Offer/answer negotiation failed inside the transport.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a structured payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The I/O layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl CastError {
    /// `true` for conditions the caller should ride out rather than
    /// report: warm-up drops and send-side backpressure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CastError::DecoderNotReady
                | CastError::ChannelNotOpen
                | CastError::ChannelSaturated { .. }
                | CastError::EncodeQueueSaturated { .. }
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for CastError {
    fn from(s: String) -> Self {
        CastError::Other(s)
    }
}

impl From<&str> for CastError {
    fn from(s: &str) -> Self {
        CastError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CastError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CastError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for CastError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        CastError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for CastError {
    fn from(e: serde_json::Error) -> Self {
        CastError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = CastError::MalformedFrame("header truncated");
        assert!(e.to_string().contains("header truncated"));

        let e = CastError::ChannelSaturated {
            buffered: 6_000_000,
            max: 5_242_880,
        };
        assert!(e.to_string().contains("6000000"));
        assert!(e.to_string().contains("5242880"));

        let e = CastError::UnknownPeer(PeerId::from("alice"));
        assert!(e.to_string().contains("alice"));
    }

    #[test]
    fn transient_classification() {
        assert!(CastError::DecoderNotReady.is_transient());
        assert!(CastError::ChannelNotOpen.is_transient());
        assert!(CastError::EncodeQueueSaturated { depth: 3 }.is_transient());
        assert!(!CastError::MalformedFrame("x").is_transient());
        assert!(!CastError::PeerTransportFailed(PeerId::from("p")).is_transient());
    }

    #[test]
    fn from_string() {
        let e: CastError = "something broke".into();
        assert!(matches!(e, CastError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: CastError = io_err.into();
        assert!(matches!(e, CastError::Connection(_)));
    }
}
