//! Configuration for the castwire node binary.

use std::path::Path;

use castwire_core::config::{BitrateMode, ChunkConfig, CodecKind, DecodeSettings, EncoderSettings, NodeSettings};
use castwire_core::signal::RoomMode;
use castwire_core::transport::chunk::MAX_CHUNK_DATA;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Room and peer settings.
    pub network: NetworkConfig,
    /// Synthetic capture source.
    pub capture: CaptureConfig,
    /// Encoder tuning.
    pub encoder: EncoderConfig,
    /// Chunked data-channel transport.
    pub transport: TransportConfig,
    /// Viewer-side decoding.
    pub decoder: DecoderConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Room and peer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Room every participant joins.
    pub room: String,
    /// "conference" (many sharers) or "classic" (one host).
    pub mode: RoomMode,
    /// Number of in-process viewers to spawn.
    pub viewers: u32,
}

/// Synthetic capture source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    /// Stop after this many frames (0 = run until Ctrl-C).
    pub frame_limit: u64,
}

/// Encoder tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Codec id: "zstd" is the only built-in backend.
    pub codec: CodecKind,
    /// Target frames per second (1-60).
    pub framerate: u32,
    /// Target bitrate in megabits per second.
    pub bitrate_mbps: u32,
    /// "variable" or "constant".
    pub bitrate_mode: BitrateMode,
    /// Frames between keyframes (0 = two seconds' worth).
    pub key_frame_interval: u32,
    /// Drop frames while more than this many are queued in the encoder.
    pub queue_threshold: usize,
}

/// Chunked data-channel transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Payload bytes per chunk (1024 up to 16 KiB minus the record header).
    pub chunk_size: usize,
    /// Refuse sends above this many buffered bytes.
    pub max_buffered: usize,
    /// Incomplete messages kept per peer.
    pub max_pending_messages: usize,
}

/// Viewer-side decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Report end-to-end latency for decoded frames.
    pub track_latency: bool,
    /// Outstanding submissions remembered per sharer.
    pub latency_capacity: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Seconds between stats lines (0 disables them).
    pub stats_interval_secs: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            room: "castwire".into(),
            mode: RoomMode::Conference,
            viewers: 2,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            frame_limit: 300,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        let base = EncoderSettings::default();
        Self {
            codec: CodecKind::Zstd,
            framerate: base.framerate,
            bitrate_mbps: base.bitrate_mbps,
            bitrate_mode: base.bitrate_mode,
            key_frame_interval: 0,
            queue_threshold: base.queue_threshold,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let base = ChunkConfig::default();
        Self {
            chunk_size: base.chunk_size,
            max_buffered: base.max_buffered,
            max_pending_messages: base.max_pending_messages,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            track_latency: true,
            latency_capacity: DecodeSettings::default().latency_capacity,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            stats_interval_secs: 2,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Convert into the library's [`NodeSettings`].
    pub fn to_node_settings(&self) -> NodeSettings {
        let interval = match self.encoder.key_frame_interval {
            0 => None,
            n => Some(n),
        };
        NodeSettings {
            encoder: EncoderSettings {
                codec: self.encoder.codec,
                framerate: self.encoder.framerate.clamp(1, 60),
                bitrate_mbps: self.encoder.bitrate_mbps.max(1),
                bitrate_mode: self.encoder.bitrate_mode,
                key_frame_interval: interval,
                queue_threshold: self.encoder.queue_threshold,
            },
            chunk: ChunkConfig {
                chunk_size: self.transport.chunk_size.clamp(1024, MAX_CHUNK_DATA),
                max_buffered: self.transport.max_buffered,
                max_pending_messages: self.transport.max_pending_messages.max(1),
            },
            decode: DecodeSettings {
                track_latency: self.decoder.track_latency,
                latency_capacity: self.decoder.latency_capacity.max(1),
            },
            auto_watch: true,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
