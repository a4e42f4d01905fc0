pub mod channel;
pub mod chunk;
pub mod memory;

pub use channel::{ChannelOptions, DataChannel, MEDIA_CHANNEL_LABEL};
pub use chunk::{ChunkRecord, ChunkTransport};
pub use memory::{MemoryChannel, MemoryFactory, MemoryNetwork, MemoryTransport};
