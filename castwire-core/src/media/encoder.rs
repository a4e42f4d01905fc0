//! Encode pipeline: capture → encoder → wire records.
//!
//! [`EncoderSession`] is the synchronous core: it applies the
//! saturation guard, decides keyframes and turns encoder output into
//! [`EncodedFrame`]s, replaying the cached decoder configuration ahead
//! of every keyframe so viewers that attach mid-stream can initialise.
//!
//! [`EncodePipeline`] runs a session on a Tokio task that pulls from a
//! [`FrameSource`] until the track ends or [`stop`](EncodePipeline::stop)
//! is called.
//!
//! ```text
//!  Idle ──start──► Encoding ──stop / track end──► Idle
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::EncoderSettings;
use crate::error::CastError;
use crate::media::backend::{CodecBackend, FLUSH_TIMEOUT, VideoEncoder};
use crate::media::capture::FrameSource;
use crate::media::types::{EncodedChunk, EncodedFrame, RawFrame, StreamConfig};

// ── EncoderStats ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    /// Frames handed to the encoder.
    pub submitted: u64,
    /// Frames discarded by the saturation guard.
    pub dropped: u64,
    /// Submissions flagged as keyframes.
    pub key_frames: u64,
    /// Config records replayed ahead of keyframes.
    pub emitted_configs: u64,
}

// ── EncoderSession ───────────────────────────────────────────────

/// One live encoder plus its keyframe and config bookkeeping.
pub struct EncoderSession {
    encoder: Box<dyn VideoEncoder>,
    frame_count: u64,
    key_frame_interval: u64,
    queue_threshold: usize,
    force_key_frame: Arc<AtomicBool>,
    cached_config: Option<StreamConfig>,
    stats: EncoderStats,
}

impl EncoderSession {
    pub fn new(
        encoder: Box<dyn VideoEncoder>,
        settings: &EncoderSettings,
        force_key_frame: Arc<AtomicBool>,
    ) -> Self {
        Self {
            encoder,
            frame_count: 0,
            key_frame_interval: settings.key_frame_interval_frames(),
            queue_threshold: settings.queue_threshold,
            force_key_frame,
            cached_config: None,
            stats: EncoderStats::default(),
        }
    }

    /// Feed one captured frame and return the records ready to send.
    ///
    /// A frame arriving while the encoder is saturated is released
    /// without being encoded. Output that completed in the meantime is
    /// still returned.
    pub fn push(&mut self, frame: RawFrame) -> Result<Vec<EncodedFrame>, CastError> {
        let depth = self.encoder.queue_depth();
        if depth > self.queue_threshold {
            self.stats.dropped += 1;
            trace!("dropping frame: {}", CastError::EncodeQueueSaturated { depth });
            drop(frame);
            let chunks = self.encoder.take_output();
            return Ok(self.collect(chunks));
        }

        let forced = self.force_key_frame.swap(false, Ordering::SeqCst);
        let key_frame = self.frame_count % self.key_frame_interval == 0 || forced;
        if forced {
            debug!("forcing keyframe at frame {}", self.frame_count);
        }

        let submitted = self.encoder.submit(frame, key_frame);
        self.frame_count += 1;
        submitted?;

        self.stats.submitted += 1;
        if key_frame {
            self.stats.key_frames += 1;
        }

        let chunks = self.encoder.take_output();
        Ok(self.collect(chunks))
    }

    /// Flush the encoder, release it and clear cached state.
    ///
    /// A flush that does not finish within [`FLUSH_TIMEOUT`] is
    /// abandoned; the encoder is closed regardless.
    pub async fn finish(&mut self) -> Vec<EncodedFrame> {
        let tail = match tokio::time::timeout(FLUSH_TIMEOUT, self.encoder.flush()).await {
            Ok(Ok(chunks)) => self.collect(chunks),
            Ok(Err(e)) => {
                warn!("encoder flush failed: {e}");
                Vec::new()
            }
            Err(_) => {
                warn!("encoder flush timed out after {FLUSH_TIMEOUT:?}; discarding tail");
                Vec::new()
            }
        };
        self.encoder.close();
        self.cached_config = None;
        tail
    }

    /// Number of frames submitted to the encoder so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// The most recent decoder configuration, if any.
    pub fn cached_config(&self) -> Option<&StreamConfig> {
        self.cached_config.as_ref()
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    fn collect(&mut self, chunks: Vec<EncodedChunk>) -> Vec<EncodedFrame> {
        let mut out = Vec::with_capacity(chunks.len() + 1);
        for mut chunk in chunks {
            if let Some(cfg) = chunk.decoder_config.take() {
                self.cached_config = Some(StreamConfig::from_decoder_config(&cfg, chunk.timestamp));
            }
            if chunk.key_frame {
                if let Some(cached) = &self.cached_config {
                    out.push(EncodedFrame::Config(StreamConfig {
                        timestamp: chunk.timestamp,
                        ..cached.clone()
                    }));
                    self.stats.emitted_configs += 1;
                }
            }
            out.push(chunk.into_video_frame());
        }
        out
    }
}

// ── EncodePipeline ───────────────────────────────────────────────

/// Owner of at most one running [`EncoderSession`].
pub struct EncodePipeline {
    settings: EncoderSettings,
    backend: Arc<dyn CodecBackend>,
    force_key_frame: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    stats_tx: Arc<watch::Sender<EncoderStats>>,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl EncodePipeline {
    pub fn new(settings: EncoderSettings, backend: Arc<dyn CodecBackend>) -> Self {
        let (stats_tx, _) = watch::channel(EncoderStats::default());
        Self {
            settings,
            backend,
            force_key_frame: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicBool::new(false)),
            stats_tx: Arc::new(stats_tx),
            cancel: None,
            handle: None,
        }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Start encoding `source`, sending records into `output`.
    ///
    /// Any session already running is stopped first.
    pub async fn start(
        &mut self,
        mut source: Box<dyn FrameSource>,
        output: mpsc::Sender<EncodedFrame>,
    ) -> Result<(), CastError> {
        self.stop().await;

        let (width, height) = source.resolution();
        let encoder = self.backend.create_encoder(&self.settings, width, height)?;
        self.force_key_frame.store(false, Ordering::SeqCst);
        let mut session = EncoderSession::new(encoder, &self.settings, Arc::clone(&self.force_key_frame));

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let active = Arc::clone(&self.active);
        let stats_tx = Arc::clone(&self.stats_tx);
        stats_tx.send_replace(EncoderStats::default());
        active.store(true, Ordering::SeqCst);

        info!(
            "encoder initialized: {} {width}x{height}@{}fps",
            self.settings.codec, self.settings.framerate
        );

        self.handle = Some(tokio::spawn(async move {
            'pull: loop {
                let frame = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    frame = source.next_frame() => frame,
                };
                let Some(frame) = frame else {
                    debug!("capture track ended");
                    break;
                };

                let records = match session.push(frame) {
                    Ok(records) => records,
                    Err(e) => {
                        warn!("frame encoding error: {e}");
                        break;
                    }
                };
                stats_tx.send_replace(session.stats());

                for record in records {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break 'pull,
                        sent = output.send(record) => {
                            if sent.is_err() {
                                debug!("encoded output receiver dropped");
                                break 'pull;
                            }
                        }
                    }
                }
            }

            source.close();
            for record in session.finish().await {
                let _ = output.try_send(record);
            }
            stats_tx.send_replace(session.stats());
            active.store(false, Ordering::SeqCst);
        }));
        self.cancel = Some(cancel);
        Ok(())
    }

    /// Ask for the next submitted frame to be a keyframe.
    ///
    /// Used when a viewer attaches and cannot wait for the next
    /// scheduled keyframe. Ignored while idle.
    pub fn request_key_frame(&self) {
        if self.is_encoding() {
            self.force_key_frame.store(true, Ordering::SeqCst);
            debug!("keyframe requested");
        }
    }

    /// Whether a session is currently pulling frames.
    pub fn is_encoding(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Live statistics for the current (or last) session.
    pub fn stats_receiver(&self) -> watch::Receiver<EncoderStats> {
        self.stats_tx.subscribe()
    }

    /// Cancel the pull loop, flush and release the encoder.
    ///
    /// Safe to call when already stopped.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("encoder task ended abnormally: {e}");
            }
            info!("encoder stopped");
        }
        self.active.store(false, Ordering::SeqCst);
        self.force_key_frame.store(false, Ordering::SeqCst);
    }
}

impl Drop for EncodePipeline {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
