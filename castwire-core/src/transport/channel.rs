//! Message-channel seam under the chunk transport.

use bytes::Bytes;

use crate::error::CastError;

/// Label of the single duplex channel opened per peer session.
pub const MEDIA_CHANNEL_LABEL: &str = "screen-share";

/// Reliability options requested when opening a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Messages are delivered in send order.
    pub ordered: bool,
    /// Retransmission attempts before a message is abandoned;
    /// `None` means fully reliable.
    pub max_retransmits: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: Some(3),
        }
    }
}

/// An ordered, message-oriented channel with a per-message size limit.
pub trait DataChannel: Send {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Bytes accepted by [`send`](Self::send) but not yet transmitted.
    fn buffered_amount(&self) -> usize;

    /// Queue one message.
    fn send(&mut self, message: Bytes) -> Result<(), CastError>;

    fn close(&mut self);
}
