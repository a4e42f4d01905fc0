//! # castwire-core
//!
//! Media transport and codec pipeline for peer-to-peer screen sharing.
//!
//! This crate contains:
//! - **Frame codec**: fixed 32-byte header wire format for encoded media records
//! - **Chunk transport**: splitting and reassembly of large payloads over a size-limited channel
//! - **Encode pipeline**: capture → encoder with backpressure, keyframe cadence and config replay
//! - **Decode pipeline**: one decoder per watched sharer, optional latency reporting
//! - **Peers**: `PeerConnectionManager` with one transport session per remote peer
//! - **Signaling**: message contract with the room relay, plus an in-process `LoopbackRelay`
//! - **Node**: `CastNode` wiring all of the above together
//! - **Error**: `CastError`, a typed `thiserror`-based error hierarchy

pub mod config;
pub mod error;
pub mod media;
pub mod node;
pub mod peer;
pub mod relay;
pub mod signal;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use config::{BitrateMode, ChunkConfig, CodecKind, DecodeSettings, EncoderSettings, NodeSettings};
pub use error::CastError;
pub use media::{
    CodecBackend, DecodePipeline, DecodedOutput, EncodePipeline, EncodedFrame, FrameSource,
    RawFrame, SyntheticSource, ZstdCodec,
};
pub use node::CastNode;
pub use peer::{PeerConnectionManager, PeerEvent, PeerId, PeerState};
pub use relay::LoopbackRelay;
pub use signal::{SignalEvent, SignalOutbox, SignalRequest};
pub use transport::{ChunkTransport, DataChannel, MemoryNetwork};
