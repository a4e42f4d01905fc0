pub mod manager;
pub mod state;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use manager::{PeerConnectionManager, PeerEvent};
pub use state::PeerState;
pub use transport::{PeerTransport, TransportEvent, TransportEventKind, TransportFactory};

/// Identifier of a remote participant as assigned by the signaling relay.
///
/// Also used as the source id of a remote stream in the decode pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
