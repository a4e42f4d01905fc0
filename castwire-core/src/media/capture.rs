//! Capture-frame readers.
//!
//! The encode pipeline pulls frames through [`FrameSource`]. Device
//! capture lives outside this crate; it either implements the trait
//! directly or pushes frames into a [`ChannelSource`].
//! [`SyntheticSource`] produces a moving test pattern for demos and
//! tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use crate::media::types::{PixelFormat, RawFrame};

/// A pull-based reader of raw frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. `None` means the track ended.
    async fn next_frame(&mut self) -> Option<RawFrame>;

    /// Frame dimensions the encoder should be configured for.
    fn resolution(&self) -> (u32, u32);

    /// Cancel the reader. Subsequent reads return `None`.
    fn close(&mut self);
}

// ── ChannelSource ────────────────────────────────────────────────

/// Frames pushed by an external capturer through an mpsc channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<RawFrame>,
    width: u32,
    height: u32,
}

impl ChannelSource {
    /// Create a source for `width × height` frames and the sender the
    /// capturer writes into.
    pub fn new(capacity: usize, width: u32, height: u32) -> (mpsc::Sender<RawFrame>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx, width, height })
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<RawFrame> {
        self.rx.recv().await
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

// ── SyntheticSource ──────────────────────────────────────────────

/// Largest width or height a [`SyntheticSource`] renders. Larger
/// requests are clamped.
pub const MAX_DIMENSION: u32 = 8192;

/// Paced generator of a diagonal gradient that scrolls one pixel per
/// frame.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    ticker: Option<Interval>,
    produced: u64,
    limit: Option<u64>,
    closed: bool,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, framerate: u32) -> Self {
        Self {
            width: width.clamp(1, MAX_DIMENSION),
            height: height.clamp(1, MAX_DIMENSION),
            frame_interval: Duration::from_secs_f64(1.0 / framerate.max(1) as f64),
            ticker: None,
            produced: 0,
            limit: None,
            closed: false,
        }
    }

    /// End the track after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Number of frames handed out so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn render(&self) -> RawFrame {
        let bpp = PixelFormat::Bgra8.bytes_per_pixel();
        let stride = self.width as usize * bpp;
        let shift = self.produced as u32;
        let mut data = Vec::with_capacity(stride * self.height as usize);

        for y in 0..self.height {
            for x in 0..self.width {
                let v = (x + y + shift) as u8;
                data.extend_from_slice(&[v, v.wrapping_mul(3), 255 - v, 0xFF]);
            }
        }

        let frame_us = self.frame_interval.as_micros() as i64;
        RawFrame {
            width: self.width,
            height: self.height,
            stride: stride as u32,
            format: PixelFormat::Bgra8,
            data,
            timestamp: self.produced as i64 * frame_us,
            duration: Some(frame_us),
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn next_frame(&mut self) -> Option<RawFrame> {
        if self.closed || self.limit.is_some_and(|limit| self.produced >= limit) {
            return None;
        }

        let interval = self.frame_interval;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut t = tokio::time::interval(interval);
            t.set_missed_tick_behavior(MissedTickBehavior::Skip);
            t
        });
        ticker.tick().await;

        let frame = self.render();
        self.produced += 1;
        Some(frame)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn synthetic_source_honours_limit() {
        let mut src = SyntheticSource::new(8, 4, 30).with_limit(3);
        let mut timestamps = Vec::new();
        while let Some(frame) = src.next_frame().await {
            assert_eq!(frame.byte_len(), 8 * 4 * 4);
            timestamps.push(frame.timestamp);
        }
        assert_eq!(timestamps.len(), 3);
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_frames_differ() {
        let mut src = SyntheticSource::new(4, 4, 60);
        let a = src.next_frame().await.unwrap();
        let b = src.next_frame().await.unwrap();
        assert_ne!(a.data, b.data);
    }

    #[tokio::test]
    async fn closed_sources_end() {
        let mut src = SyntheticSource::new(4, 4, 60);
        src.close();
        assert!(src.next_frame().await.is_none());

        let (tx, mut chan) = ChannelSource::new(4, 1, 1);
        chan.close();
        assert!(tx.send(SyntheticSource::new(1, 1, 1).render()).await.is_err());
        assert!(chan.next_frame().await.is_none());
    }

    #[test]
    fn oversized_dimensions_are_clamped() {
        let src = SyntheticSource::new(70_000, 0, 30);
        assert_eq!(src.resolution(), (MAX_DIMENSION, 1));

        let frame = SyntheticSource::new(MAX_DIMENSION, 2, 30).render();
        assert_eq!(frame.stride, MAX_DIMENSION * 4);
        assert_eq!(frame.byte_len(), MAX_DIMENSION as usize * 2 * 4);
    }
}
