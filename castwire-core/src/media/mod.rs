pub mod backend;
pub mod capture;
pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod latency;
pub mod types;
pub mod zstd;

pub use backend::{CodecBackend, VideoDecoder, VideoEncoder, supported_codecs};
pub use capture::{ChannelSource, FrameSource, SyntheticSource};
pub use decoder::{DecodePipeline, DecodedOutput, DecoderStats};
pub use encoder::{EncodePipeline, EncoderSession, EncoderStats};
pub use frame::{FrameFlags, FrameHeader, FrameKind};
pub use latency::PendingTimestamps;
pub use types::{
    DecodedFrame, DecoderConfig, EncodedChunk, EncodedFrame, MediaFrame, PixelFormat, RawFrame,
    StreamConfig,
};
pub use self::zstd::ZstdCodec;
