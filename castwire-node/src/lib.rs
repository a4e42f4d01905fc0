//! # castwire-node: In-process screen-share mesh
//!
//! Runs one sharer and a configurable number of viewers inside a single
//! process, wired together by the loopback relay and the in-memory
//! transport. Useful for exercising the full capture → encode → chunk →
//! reassemble → decode path without a browser or a signaling server.
//!
//! ## Modes
//!
//! - **Conference**: the sharer announces itself; viewers watch on their own.
//! - **Classic**: the sharer joins as host; viewers request its stream.

pub mod config;
pub mod mesh;
