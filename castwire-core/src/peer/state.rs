//! Per-peer connection state machine.
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::time::Instant;

use crate::error::CastError;

// ── PeerState ────────────────────────────────────────────────────

/// Lifecycle of one peer session.
///
/// ```text
///  Connecting ──► Connected
///      │              │
///      ▼              ▼
///   Failed / Closed ◄─┘
/// ```
///
/// A session exists only from the first offer sent or received, so
/// there is no idle variant; an absent map entry plays that role.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Offer produced or received; transport not yet up.
    #[default]
    Connecting,

    /// Transport reported connected.
    Connected {
        /// When the session entered the `Connected` state.
        since: Instant,
    },

    /// Transport reported a failure. Terminal.
    Failed,

    /// Transport closed or torn down locally. Terminal.
    Closed,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected { .. } => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// `true` for `Failed` and `Closed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// How long the session has been connected. `None` in any other state.
    pub fn connected_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Connecting`.
    pub fn mark_connected(&mut self) -> Result<(), CastError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(CastError::ProtocolViolation(
                "cannot connect: session not in Connecting state",
            )),
        }
    }

    /// Valid from: `Connecting`, `Connected`.
    pub fn mark_failed(&mut self) -> Result<(), CastError> {
        match self {
            Self::Connecting | Self::Connected { .. } => {
                *self = Self::Failed;
                Ok(())
            }
            _ => Err(CastError::ProtocolViolation(
                "cannot fail: session already terminal",
            )),
        }
    }

    /// Move to `Closed` from any state. Closing twice is harmless.
    pub fn close(&mut self) {
        if !matches!(self, Self::Failed) {
            *self = Self::Closed;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
