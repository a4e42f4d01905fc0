//! Library-level settings for the encode pipeline, chunk transport,
//! decode pipeline and node orchestrator.
//!
//! Binaries load their own file format and convert into these
//! (see `castwire-node`'s `config.rs`).

use serde::{Deserialize, Serialize};

// ── CodecKind ────────────────────────────────────────────────────

/// Codec families the pipeline knows how to name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    /// Built-in software codec (lossless, zstd-compressed frames).
    Zstd,
}

impl CodecKind {
    /// All codecs in preference order.
    pub const ALL: [CodecKind; 6] = [
        CodecKind::H264,
        CodecKind::Hevc,
        CodecKind::Vp8,
        CodecKind::Vp9,
        CodecKind::Av1,
        CodecKind::Zstd,
    ];

    /// Codec identifier carried in config frames.
    ///
    /// H.264 is High Profile level 4.0; HEVC is Main Profile level 4.0.
    pub const fn codec_string(self) -> &'static str {
        match self {
            CodecKind::H264 => "avc1.640028",
            CodecKind::Hevc => "hvc1.1.6.L120.90",
            CodecKind::Vp8 => "vp8",
            CodecKind::Vp9 => "vp09.00.10.08",
            CodecKind::Av1 => "av01.0.04M.08",
            CodecKind::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.codec_string())
    }
}

/// Rate-control mode requested from the encoder backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitrateMode {
    #[default]
    Variable,
    Constant,
}

// ── EncoderSettings ──────────────────────────────────────────────

/// Configuration for [`EncodePipeline`](crate::media::encoder::EncodePipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub codec: CodecKind,
    /// Target frames per second.
    pub framerate: u32,
    /// Target bitrate in megabits per second. Rate control is a hint:
    /// backends with a rate controller honour it, and the lossless
    /// zstd backend only logs it.
    pub bitrate_mbps: u32,
    /// Rate-control mode handed to the backend with the bitrate.
    pub bitrate_mode: BitrateMode,
    /// Frames between scheduled keyframes; `None` means two seconds'
    /// worth of frames.
    pub key_frame_interval: Option<u32>,
    /// Frames are dropped while the encoder has more than this many
    /// submissions pending.
    pub queue_threshold: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: CodecKind::H264,
            framerate: 30,
            bitrate_mbps: 4,
            bitrate_mode: BitrateMode::Variable,
            key_frame_interval: None,
            queue_threshold: 2,
        }
    }
}

impl EncoderSettings {
    /// Effective keyframe interval in frames (never zero).
    pub fn key_frame_interval_frames(&self) -> u64 {
        let frames = self
            .key_frame_interval
            .unwrap_or_else(|| self.framerate.saturating_mul(2));
        u64::from(frames.max(1))
    }

    /// Target bitrate in bits per second.
    pub fn bitrate_bps(&self) -> u64 {
        u64::from(self.bitrate_mbps) * 1_000_000
    }
}

// ── ChunkConfig ──────────────────────────────────────────────────

/// Configuration for [`ChunkTransport`](crate::transport::chunk::ChunkTransport).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Payload bytes per Chunk record (the 7-byte header comes on top).
    pub chunk_size: usize,
    /// Sends are refused while the channel has more than this many
    /// bytes queued.
    pub max_buffered: usize,
    /// Incomplete messages kept per peer before the oldest is evicted.
    pub max_pending_messages: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            max_buffered: 5 * 1024 * 1024,
            max_pending_messages: 64,
        }
    }
}

// ── DecodeSettings ───────────────────────────────────────────────

/// Configuration for [`DecodePipeline`](crate::media::decoder::DecodePipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeSettings {
    /// Report submit-to-output latency with every decoded frame.
    pub track_latency: bool,
    /// Outstanding submissions remembered per source for latency.
    pub latency_capacity: usize,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            track_latency: false,
            latency_capacity: 100,
        }
    }
}

// ── NodeSettings ─────────────────────────────────────────────────

/// Everything a [`CastNode`](crate::node::CastNode) needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub encoder: EncoderSettings,
    pub chunk: ChunkConfig,
    pub decode: DecodeSettings,
    /// Start watching every sharer announced by the relay.
    pub auto_watch: bool,
}

// ── Tests ────────────────────────────────────────────────────────
