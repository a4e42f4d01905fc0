//! Encoder / decoder seams.
//!
//! The pipelines never talk to a codec library directly; they drive a
//! [`VideoEncoder`] or [`VideoDecoder`] obtained from a
//! [`CodecBackend`]. Hardware codecs, platform media frameworks and the
//! built-in [`ZstdCodec`](crate::media::zstd::ZstdCodec) all plug in here.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{CodecKind, EncoderSettings};
use crate::error::CastError;
use crate::media::types::{DecodedFrame, DecoderConfig, EncodedChunk, RawFrame};

/// Longest a pipeline waits on a device flush while stopping. The
/// device is closed either way.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// A configured video encoder.
///
/// Submissions are queued inside the encoder; finished chunks are
/// collected with [`take_output`](Self::take_output).
#[async_trait]
pub trait VideoEncoder: Send {
    /// Number of submitted frames not yet turned into output.
    fn queue_depth(&self) -> usize;

    /// Queue a frame for encoding. The encoder takes ownership of the
    /// raw buffer.
    fn submit(&mut self, frame: RawFrame, key_frame: bool) -> Result<(), CastError>;

    /// Drain every chunk finished since the last call.
    fn take_output(&mut self) -> Vec<EncodedChunk>;

    /// Finish all queued work and return the remaining output.
    async fn flush(&mut self) -> Result<Vec<EncodedChunk>, CastError>;

    /// Release the underlying device. Further calls are invalid.
    fn close(&mut self);
}

/// A video decoder for a single remote stream.
#[async_trait]
pub trait VideoDecoder: Send {
    /// Apply (or replace) the decoder configuration.
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), CastError>;

    /// Whether a configuration is in effect.
    fn is_configured(&self) -> bool;

    /// Queue one encoded unit for decoding.
    fn decode(&mut self, chunk: EncodedChunk) -> Result<(), CastError>;

    /// Drain every frame decoded since the last call.
    fn take_output(&mut self) -> Vec<DecodedFrame>;

    /// Finish all queued work and return the remaining frames.
    async fn flush(&mut self) -> Result<Vec<DecodedFrame>, CastError>;

    /// Release the underlying device.
    fn close(&mut self);
}

/// Factory for encoders and decoders of one codec family.
pub trait CodecBackend: Send + Sync {
    /// Whether this backend can encode and decode `codec`.
    fn supports(&self, codec: &str) -> bool;

    /// Create and configure an encoder for `width × height` input.
    fn create_encoder(
        &self,
        settings: &EncoderSettings,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoEncoder>, CastError>;

    /// Create an unconfigured decoder.
    fn create_decoder(&self) -> Box<dyn VideoDecoder>;
}

/// Every [`CodecKind`] the backend can handle, in preference order.
pub fn supported_codecs(backend: &dyn CodecBackend) -> Vec<CodecKind> {
    CodecKind::ALL
        .into_iter()
        .filter(|kind| backend.supports(kind.codec_string()))
        .collect()
}
