//! Shared frame types for the capture → encode → wire → decode pipeline.
//!
//! [`RawFrame`] is what a capture source hands to the encoder,
//! [`EncodedChunk`] is what an encoder backend produces, and
//! [`EncodedFrame`] is the tagged record that crosses the wire
//! (see [`crate::media::frame`]). Payload buffers are owned `Bytes`:
//! ownership moves into the transport at submission and the buffer is
//! released once serialized.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CastError;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

// ── RawFrame ─────────────────────────────────────────────────────

/// A raw, uncompressed frame obtained from a capture source.
///
/// The `data` buffer holds `height` rows of `stride` bytes each.
/// `stride` may be larger than `width * bytes_per_pixel` when the
/// capture device pads rows.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes** (may exceed `width * bpp`).
    pub stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data, `stride * height` bytes.
    pub data: Vec<u8>,
    /// Source-clock timestamp in microseconds.
    pub timestamp: i64,
    /// Frame duration in microseconds, if the source knows it.
    pub duration: Option<i64>,
}

impl RawFrame {
    /// Total byte size the raw bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Copy the visible pixels into a tightly packed buffer (no row padding).
    pub fn packed(&self) -> Result<Vec<u8>, CastError> {
        let row_len = self.width as usize * self.format.bytes_per_pixel();
        if (self.stride as usize) < row_len || self.data.len() < self.byte_len() {
            return Err(CastError::Codec(format!(
                "raw frame buffer too short: {} bytes for {}x{} stride {}",
                self.data.len(),
                self.width,
                self.height,
                self.stride
            )));
        }

        let mut out = Vec::with_capacity(row_len * self.height as usize);
        for y in 0..self.height as usize {
            let row_start = y * self.stride as usize;
            out.extend_from_slice(&self.data[row_start..row_start + row_len]);
        }
        Ok(out)
    }
}

// ── EncodedFrame (wire record) ───────────────────────────────────

/// Timestamped media payload carried by Video and Audio records.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    /// Source-clock timestamp in microseconds, non-decreasing per source.
    pub timestamp: i64,
    /// Duration in microseconds; `None` when unknown.
    pub duration: Option<i64>,
    /// Whether the payload decodes without a reference frame.
    pub key_frame: bool,
    /// Opaque encoded payload.
    pub payload: Bytes,
}

/// Decoder configuration carried by a Config record.
///
/// All descriptive fields are optional on the wire; a decoder only
/// accepts the record once codec and both dimensions are present
/// (see [`StreamConfig::decoder_config`]).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub timestamp: i64,
    pub codec: Option<String>,
    pub coded_width: Option<u16>,
    pub coded_height: Option<u16>,
    /// Codec-specific description blob; may be empty.
    pub extra_data: Bytes,
}

impl StreamConfig {
    /// Build the wire record for a backend-reported configuration.
    pub fn from_decoder_config(config: &DecoderConfig, timestamp: i64) -> Self {
        Self {
            timestamp,
            codec: Some(config.codec.clone()),
            coded_width: Some(config.coded_width),
            coded_height: Some(config.coded_height),
            extra_data: config.description.clone().unwrap_or_default(),
        }
    }

    /// Validate the record and turn it into a decoder configuration.
    pub fn decoder_config(&self) -> Result<DecoderConfig, CastError> {
        let codec = match self.codec.as_deref() {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => return Err(CastError::DecoderConfigInvalid("missing codec")),
        };
        let coded_width = self
            .coded_width
            .filter(|w| *w > 0)
            .ok_or(CastError::DecoderConfigInvalid("missing coded width"))?;
        let coded_height = self
            .coded_height
            .filter(|h| *h > 0)
            .ok_or(CastError::DecoderConfigInvalid("missing coded height"))?;

        Ok(DecoderConfig {
            codec,
            coded_width,
            coded_height,
            description: (!self.extra_data.is_empty()).then(|| self.extra_data.clone()),
        })
    }
}

/// A tagged media record as carried over the data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedFrame {
    Video(MediaFrame),
    Audio(MediaFrame),
    Config(StreamConfig),
}

impl EncodedFrame {
    /// Source-clock timestamp of the record.
    pub fn timestamp(&self) -> i64 {
        match self {
            EncodedFrame::Video(m) | EncodedFrame::Audio(m) => m.timestamp,
            EncodedFrame::Config(c) => c.timestamp,
        }
    }

    /// `true` for a Video record flagged as a keyframe.
    pub fn is_key_frame(&self) -> bool {
        matches!(self, EncodedFrame::Video(m) if m.key_frame)
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            EncodedFrame::Video(_) => "video",
            EncodedFrame::Audio(_) => "audio",
            EncodedFrame::Config(_) => "config",
        }
    }
}

// ── Backend-facing types ─────────────────────────────────────────

/// Everything a decoder needs before it can accept media.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    pub codec: String,
    pub coded_width: u16,
    pub coded_height: u16,
    pub description: Option<Bytes>,
}

/// One unit of encoder output.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub timestamp: i64,
    pub duration: Option<i64>,
    pub key_frame: bool,
    pub data: Bytes,
    /// Set when the encoder reports a new decoder configuration with
    /// this output.
    pub decoder_config: Option<DecoderConfig>,
}

impl EncodedChunk {
    /// Wire record for this chunk. The payload buffer moves into it.
    pub fn into_video_frame(self) -> EncodedFrame {
        EncodedFrame::Video(MediaFrame {
            timestamp: self.timestamp,
            duration: self.duration,
            key_frame: self.key_frame,
            payload: self.data,
        })
    }
}

/// A decompressed frame ready for playback.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub timestamp: i64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Tightly packed pixel rows.
    pub data: Vec<u8>,
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn padded_frame() -> RawFrame {
        // 2x2 Bgra8 with 4 bytes of padding per row.
        RawFrame {
            width: 2,
            height: 2,
            stride: 12,
            format: PixelFormat::Bgra8,
            data: vec![
                1, 1, 1, 1, 2, 2, 2, 2, 0xEE, 0xEE, 0xEE, 0xEE, //
                3, 3, 3, 3, 4, 4, 4, 4, 0xEE, 0xEE, 0xEE, 0xEE,
            ],
            timestamp: 0,
            duration: None,
        }
    }

    #[test]
    fn packed_strips_row_padding() {
        let packed = padded_frame().packed().unwrap();
        assert_eq!(packed.len(), 16);
        assert!(!packed.contains(&0xEE));
        assert_eq!(&packed[8..12], &[3, 3, 3, 3]);
    }

    #[test]
    fn packed_rejects_short_buffer() {
        let mut frame = padded_frame();
        frame.data.truncate(10);
        assert!(frame.packed().is_err());
    }

    #[test]
    fn config_requires_codec_and_dimensions() {
        let mut cfg = StreamConfig {
            timestamp: 0,
            codec: Some("zstd".into()),
            coded_width: Some(640),
            coded_height: None,
            extra_data: Bytes::new(),
        };
        assert!(matches!(
            cfg.decoder_config(),
            Err(CastError::DecoderConfigInvalid(_))
        ));

        cfg.coded_height = Some(480);
        let dc = cfg.decoder_config().unwrap();
        assert_eq!(dc.codec, "zstd");
        assert!(dc.description.is_none(), "empty extra data means no description");
    }

    #[test]
    fn decoder_config_roundtrips_through_stream_config() {
        let dc = DecoderConfig {
            codec: "avc1.640028".into(),
            coded_width: 1920,
            coded_height: 1080,
            description: Some(Bytes::from_static(&[1, 2, 3])),
        };
        let sc = StreamConfig::from_decoder_config(&dc, 42);
        assert_eq!(sc.timestamp, 42);
        assert_eq!(sc.decoder_config().unwrap(), dc);
    }
}
