//! Built-in software codec: zstd-compressed frames.
//!
//! Encodes [`RawFrame`]s into compact [`EncodedChunk`]s without any
//! hardware support, so the whole pipeline runs anywhere:
//!
//! - **Keyframe**: tightly packed pixel rows → zstd compress.
//! - **Delta frame**: packed rows XOR previous packed frame → zstd
//!   compress. Unchanged regions become runs of zeros and compress
//!   to almost nothing.
//!
//! The decoder configuration blob is a bincode [`ZstdStreamParams`].

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CodecKind, EncoderSettings};
use crate::error::CastError;
use crate::media::backend::{CodecBackend, VideoDecoder, VideoEncoder};
use crate::media::types::{
    DecodedFrame, DecoderConfig, EncodedChunk, PixelFormat, RawFrame,
};

/// Codec identifier for this backend.
pub const ZSTD_CODEC: &str = CodecKind::Zstd.codec_string();

/// Stream parameters carried as the config frame's extra data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZstdStreamParams {
    pub format: PixelFormat,
    pub level: i32,
}

fn xor_into(dst: &mut [u8], reference: &[u8]) {
    for (d, r) in dst.iter_mut().zip(reference) {
        *d ^= r;
    }
}

// ── ZstdCodec ────────────────────────────────────────────────────

/// [`CodecBackend`] for the `zstd` codec id.
#[derive(Debug, Clone)]
pub struct ZstdCodec {
    /// zstd compression level (1 = fastest).
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self {
            level: level.clamp(1, 19),
        }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(1)
    }
}

impl CodecBackend for ZstdCodec {
    fn supports(&self, codec: &str) -> bool {
        codec == ZSTD_CODEC
    }

    fn create_encoder(
        &self,
        settings: &EncoderSettings,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoEncoder>, CastError> {
        if settings.codec != CodecKind::Zstd {
            return Err(CastError::UnsupportedCodec(settings.codec.to_string()));
        }
        debug!(
            "zstd encoder created: {width}x{height}@{}fps level {}, target {} bps ({:?}, ignored)",
            settings.framerate,
            self.level,
            settings.bitrate_bps(),
            settings.bitrate_mode
        );
        Ok(Box::new(ZstdEncoder::new(self.level, width, height)))
    }

    fn create_decoder(&self) -> Box<dyn VideoDecoder> {
        Box::new(ZstdDecoder::new())
    }
}

// ── ZstdEncoder ──────────────────────────────────────────────────

pub struct ZstdEncoder {
    level: i32,
    width: u32,
    height: u32,
    format: Option<PixelFormat>,
    /// Packed pixels of the last encoded frame.
    reference: Option<Vec<u8>>,
    /// A decoder config must accompany the next output.
    config_due: bool,
    output: VecDeque<EncodedChunk>,
    closed: bool,
}

impl ZstdEncoder {
    pub fn new(level: i32, width: u32, height: u32) -> Self {
        Self {
            level,
            width,
            height,
            format: None,
            reference: None,
            config_due: true,
            output: VecDeque::new(),
            closed: false,
        }
    }

    fn decoder_config(&self, format: PixelFormat) -> Result<DecoderConfig, CastError> {
        let coded_width = u16::try_from(self.width)
            .map_err(|_| CastError::Codec(format!("width {} exceeds u16", self.width)))?;
        let coded_height = u16::try_from(self.height)
            .map_err(|_| CastError::Codec(format!("height {} exceeds u16", self.height)))?;
        let params = ZstdStreamParams {
            format,
            level: self.level,
        };
        Ok(DecoderConfig {
            codec: ZSTD_CODEC.to_string(),
            coded_width,
            coded_height,
            description: Some(Bytes::from(bincode::serialize(&params)?)),
        })
    }
}

#[async_trait]
impl VideoEncoder for ZstdEncoder {
    fn queue_depth(&self) -> usize {
        // Encoding is synchronous inside `submit`.
        0
    }

    fn submit(&mut self, frame: RawFrame, key_frame: bool) -> Result<(), CastError> {
        if self.closed {
            return Err(CastError::Codec("encoder closed".into()));
        }

        // Dimension or format changes restart the stream.
        if frame.width != self.width
            || frame.height != self.height
            || self.format != Some(frame.format)
        {
            self.width = frame.width;
            self.height = frame.height;
            self.format = Some(frame.format);
            self.reference = None;
            self.config_due = true;
        }

        let packed = frame.packed()?;
        let key_frame = key_frame || self.config_due;

        let compressed = match (&self.reference, key_frame) {
            (Some(reference), false) => {
                let mut delta = packed.clone();
                xor_into(&mut delta, reference);
                ::zstd::encode_all(delta.as_slice(), self.level)
            }
            _ => ::zstd::encode_all(packed.as_slice(), self.level),
        }
        .map_err(|e| CastError::Codec(format!("zstd encode failed: {e}")))?;

        let decoder_config = if self.config_due {
            self.config_due = false;
            Some(self.decoder_config(frame.format)?)
        } else {
            None
        };

        self.reference = Some(packed);
        self.output.push_back(EncodedChunk {
            timestamp: frame.timestamp,
            duration: frame.duration,
            key_frame,
            data: Bytes::from(compressed),
            decoder_config,
        });
        Ok(())
    }

    fn take_output(&mut self) -> Vec<EncodedChunk> {
        self.output.drain(..).collect()
    }

    async fn flush(&mut self) -> Result<Vec<EncodedChunk>, CastError> {
        Ok(self.take_output())
    }

    fn close(&mut self) {
        self.closed = true;
        self.reference = None;
        self.output.clear();
    }
}

// ── ZstdDecoder ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct DecoderState {
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// Decoder that maintains the reference frame deltas apply to.
pub struct ZstdDecoder {
    state: Option<DecoderState>,
    reference: Option<Vec<u8>>,
    output: Vec<DecodedFrame>,
}

impl ZstdDecoder {
    pub fn new() -> Self {
        Self {
            state: None,
            reference: None,
            output: Vec::new(),
        }
    }
}

impl Default for ZstdDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VideoDecoder for ZstdDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), CastError> {
        if config.codec != ZSTD_CODEC {
            return Err(CastError::UnsupportedCodec(config.codec.clone()));
        }
        let format = match &config.description {
            Some(desc) => bincode::deserialize::<ZstdStreamParams>(desc)?.format,
            None => PixelFormat::Bgra8,
        };

        self.state = Some(DecoderState {
            width: u32::from(config.coded_width),
            height: u32::from(config.coded_height),
            format,
        });
        self.reference = None;
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.state.is_some()
    }

    fn decode(&mut self, chunk: EncodedChunk) -> Result<(), CastError> {
        let state = self.state.ok_or(CastError::DecoderNotReady)?;

        let expected =
            state.width as usize * state.height as usize * state.format.bytes_per_pixel();
        // Output is capped at one frame; larger payloads fail inside zstd.
        let mut pixels = ::zstd::bulk::decompress(chunk.data.as_ref(), expected)
            .map_err(|e| CastError::Codec(format!("zstd decode failed: {e}")))?;

        if pixels.len() != expected {
            return Err(CastError::Codec(format!(
                "decoded size mismatch: {} != {}",
                pixels.len(),
                expected
            )));
        }

        if !chunk.key_frame {
            let reference = self
                .reference
                .as_ref()
                .ok_or_else(|| CastError::Codec("delta frame without reference".into()))?;
            xor_into(&mut pixels, reference);
        }

        self.reference = Some(pixels.clone());
        self.output.push(DecodedFrame {
            timestamp: chunk.timestamp,
            width: state.width,
            height: state.height,
            format: state.format,
            data: pixels,
        });
        Ok(())
    }

    fn take_output(&mut self) -> Vec<DecodedFrame> {
        std::mem::take(&mut self.output)
    }

    async fn flush(&mut self) -> Result<Vec<DecodedFrame>, CastError> {
        Ok(self.take_output())
    }

    fn close(&mut self) {
        self.state = None;
        self.reference = None;
        self.output.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────────
