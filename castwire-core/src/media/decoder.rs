//! Decode pipeline: one decoder per remote source.
//!
//! A viewer in a mesh conference may watch several sharers at once, so
//! [`DecodePipeline`] keeps an owning table of [`DecoderSession`]s keyed
//! by the sharer's [`PeerId`]. Each session holds the decoder, the
//! configuration in effect and the pending-timestamp queue used for
//! latency reporting. Removing the table entry releases all of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::DecodeSettings;
use crate::error::CastError;
use crate::media::backend::{CodecBackend, FLUSH_TIMEOUT, VideoDecoder};
use crate::media::latency::PendingTimestamps;
use crate::media::types::{DecodedFrame, DecoderConfig, EncodedChunk, EncodedFrame, MediaFrame};
use crate::peer::PeerId;

// ── Output & stats ───────────────────────────────────────────────

/// A decoded frame tagged with the source it came from.
#[derive(Debug, Clone)]
pub struct DecodedOutput {
    pub source: PeerId,
    pub frame: DecodedFrame,
    /// Submit-to-output time; `None` unless latency tracking is on.
    /// Zero when the submission was not found.
    pub latency: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub decoded: u64,
    /// Video records discarded because no config had been applied.
    pub dropped_not_ready: u64,
    pub rejected_configs: u64,
    pub errors: u64,
}

// ── DecoderSession ───────────────────────────────────────────────

/// Everything owned on behalf of one remote source.
pub struct DecoderSession {
    decoder: Box<dyn VideoDecoder>,
    config: Option<DecoderConfig>,
    pending: Option<PendingTimestamps>,
    output: mpsc::UnboundedSender<DecodedOutput>,
    stats: DecoderStats,
}

impl DecoderSession {
    fn forward(&mut self, source: &PeerId, frames: Vec<DecodedFrame>) {
        for frame in frames {
            let latency = self
                .pending
                .as_mut()
                .map(|p| p.take(frame.timestamp).unwrap_or(Duration::ZERO));
            self.stats.decoded += 1;
            let out = DecodedOutput {
                source: source.clone(),
                frame,
                latency,
            };
            if self.output.send(out).is_err() {
                trace!("decoded output for {source} has no receiver");
            }
        }
    }

    /// Configuration currently in effect.
    pub fn config(&self) -> Option<&DecoderConfig> {
        self.config.as_ref()
    }

    /// Submissions still waiting for output (latency tracking only).
    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, PendingTimestamps::len)
    }
}

// ── DecodePipeline ───────────────────────────────────────────────

pub struct DecodePipeline {
    backend: Arc<dyn CodecBackend>,
    settings: DecodeSettings,
    sessions: HashMap<PeerId, DecoderSession>,
}

impl DecodePipeline {
    pub fn new(settings: DecodeSettings, backend: Arc<dyn CodecBackend>) -> Self {
        Self {
            backend,
            settings,
            sessions: HashMap::new(),
        }
    }

    /// Create a fresh decoder for `source`, replacing any existing one.
    ///
    /// Decoded frames are delivered on `output`.
    pub async fn init_decoder(&mut self, source: PeerId, output: mpsc::UnboundedSender<DecodedOutput>) {
        if self.sessions.contains_key(&source) {
            debug!("replacing decoder for {source}");
            self.stop_decoder(&source).await;
        }

        let pending = self
            .settings
            .track_latency
            .then(|| PendingTimestamps::new(self.settings.latency_capacity));
        self.sessions.insert(
            source.clone(),
            DecoderSession {
                decoder: self.backend.create_decoder(),
                config: None,
                pending,
                output,
                stats: DecoderStats::default(),
            },
        );
        info!("decoder initialized for {source}");
    }

    /// Feed one wire record from `source`.
    ///
    /// Video arriving before a valid config is dropped and counted; it
    /// is not an error. An invalid config is rejected and the previous
    /// configuration stays in effect.
    pub fn decode(&mut self, source: &PeerId, frame: &EncodedFrame) -> Result<(), CastError> {
        let session = self
            .sessions
            .get_mut(source)
            .ok_or_else(|| CastError::UnknownPeer(source.clone()))?;

        match frame {
            EncodedFrame::Config(cfg) => {
                let config = match cfg.decoder_config() {
                    Ok(config) => config,
                    Err(e) => {
                        session.stats.rejected_configs += 1;
                        warn!("ignoring config from {source}: {e}");
                        return Err(e);
                    }
                };
                if session.config.as_ref() == Some(&config) && session.decoder.is_configured() {
                    trace!("config from {source} unchanged");
                    return Ok(());
                }
                if let Err(e) = session.decoder.configure(&config) {
                    session.stats.rejected_configs += 1;
                    warn!("decoder for {source} refused config {}: {e}", config.codec);
                    return Err(e);
                }
                info!(
                    "decoder for {source} configured: {} {}x{}",
                    config.codec, config.coded_width, config.coded_height
                );
                session.config = Some(config);
                Ok(())
            }
            EncodedFrame::Video(media) => {
                if !session.decoder.is_configured() {
                    session.stats.dropped_not_ready += 1;
                    trace!("dropping video from {source}: decoder not configured");
                    return Ok(());
                }
                Self::submit(session, source, media)
            }
            EncodedFrame::Audio(_) => {
                trace!("audio record from {source} ignored");
                Ok(())
            }
        }
    }

    fn submit(session: &mut DecoderSession, source: &PeerId, media: &MediaFrame) -> Result<(), CastError> {
        if let Some(pending) = session.pending.as_mut() {
            pending.record(media.timestamp);
        }
        let chunk = EncodedChunk {
            timestamp: media.timestamp,
            duration: media.duration,
            key_frame: media.key_frame,
            data: media.payload.clone(),
            decoder_config: None,
        };
        match session.decoder.decode(chunk) {
            Ok(()) => {}
            Err(CastError::DecoderNotReady) => {
                session.stats.dropped_not_ready += 1;
                return Ok(());
            }
            Err(e) => {
                session.stats.errors += 1;
                warn!("decode error for {source}: {e}");
                return Err(e);
            }
        }
        let frames = session.decoder.take_output();
        session.forward(source, frames);
        Ok(())
    }

    /// Flush, close and forget the decoder for `source`.
    ///
    /// The flush is bounded by [`FLUSH_TIMEOUT`]; the decoder is closed
    /// either way. Unknown ids are ignored.
    pub async fn stop_decoder(&mut self, source: &PeerId) {
        let Some(mut session) = self.sessions.remove(source) else {
            return;
        };
        match tokio::time::timeout(FLUSH_TIMEOUT, session.decoder.flush()).await {
            Ok(Ok(frames)) => session.forward(source, frames),
            Ok(Err(e)) => debug!("decoder flush for {source} failed: {e}"),
            Err(_) => warn!("decoder flush for {source} timed out after {FLUSH_TIMEOUT:?}"),
        }
        session.decoder.close();
        info!("decoder stopped for {source}");
    }

    /// Stop every tracked decoder.
    pub async fn stop_all(&mut self) {
        let sources: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for source in sources {
            self.stop_decoder(&source).await;
        }
    }

    pub fn has_decoder(&self, source: &PeerId) -> bool {
        self.sessions.contains_key(source)
    }

    pub fn session(&self, source: &PeerId) -> Option<&DecoderSession> {
        self.sessions.get(source)
    }

    pub fn stats(&self, source: &PeerId) -> Option<DecoderStats> {
        self.sessions.get(source).map(|s| s.stats)
    }

    pub fn sources(&self) -> impl Iterator<Item = &PeerId> {
        self.sessions.keys()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::config::{CodecKind, EncoderSettings};
    use crate::media::types::{PixelFormat, RawFrame, StreamConfig};
    use crate::media::zstd::ZstdCodec;

    fn backend() -> Arc<dyn CodecBackend> {
        Arc::new(ZstdCodec::default())
    }

    fn pipeline(track_latency: bool) -> DecodePipeline {
        DecodePipeline::new(
            DecodeSettings {
                track_latency,
                ..Default::default()
            },
            backend(),
        )
    }

    /// Config + keyframe + delta produced by the zstd encoder.
    fn encoded_stream() -> Vec<EncodedFrame> {
        let settings = EncoderSettings {
            codec: CodecKind::Zstd,
            ..Default::default()
        };
        let mut encoder = backend().create_encoder(&settings, 2, 2).unwrap();
        let mut out = Vec::new();
        for (i, fill) in [10u8, 20].into_iter().enumerate() {
            let frame = RawFrame {
                width: 2,
                height: 2,
                stride: 8,
                format: PixelFormat::Bgra8,
                data: vec![fill; 16],
                timestamp: i as i64 * 33_333,
                duration: None,
            };
            encoder.submit(frame, i == 0).unwrap();
        }
        for chunk in encoder.take_output() {
            if let Some(cfg) = &chunk.decoder_config {
                out.push(EncodedFrame::Config(StreamConfig::from_decoder_config(cfg, chunk.timestamp)));
            }
            out.push(chunk.into_video_frame());
        }
        out
    }

    #[tokio::test]
    async fn config_then_keyframe_decodes() {
        let stream = encoded_stream();
        let mut dp = pipeline(false);
        let a = PeerId::from("A");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dp.init_decoder(a.clone(), tx).await;

        for record in &stream {
            assert_ok!(dp.decode(&a, record));
        }
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.source, a);
        assert_eq!(first.frame.data, vec![10; 16]);
        assert_eq!(second.frame.data, vec![20; 16]);
        assert!(first.latency.is_none());
        assert_eq!(dp.stats(&a).unwrap().decoded, 2);
    }

    #[tokio::test]
    async fn config_with_empty_extra_data_then_keyframe() {
        let mut stream = encoded_stream();
        // Without a description the zstd decoder assumes Bgra8.
        if let EncodedFrame::Config(cfg) = &mut stream[0] {
            cfg.extra_data = Bytes::new();
        }
        let mut dp = pipeline(false);
        let a = PeerId::from("A");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dp.init_decoder(a.clone(), tx).await;

        assert_ok!(dp.decode(&a, &stream[0]));
        assert_ok!(dp.decode(&a, &stream[1]));
        assert_eq!(rx.recv().await.unwrap().frame.data, vec![10; 16]);
    }

    #[tokio::test]
    async fn video_before_config_is_dropped() {
        let stream = encoded_stream();
        let mut dp = pipeline(false);
        let a = PeerId::from("A");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dp.init_decoder(a.clone(), tx).await;

        assert_ok!(dp.decode(&a, &stream[1]));
        assert!(rx.try_recv().is_err());
        assert_eq!(dp.stats(&a).unwrap().dropped_not_ready, 1);

        // Decoder still comes up once the config arrives.
        assert_ok!(dp.decode(&a, &stream[0]));
        assert_ok!(dp.decode(&a, &stream[1]));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn invalid_config_keeps_previous() {
        let stream = encoded_stream();
        let mut dp = pipeline(false);
        let a = PeerId::from("A");
        let (tx, _rx) = mpsc::unbounded_channel();
        dp.init_decoder(a.clone(), tx).await;
        assert_ok!(dp.decode(&a, &stream[0]));

        let broken = EncodedFrame::Config(StreamConfig {
            timestamp: 0,
            codec: Some("zstd".into()),
            coded_width: None,
            coded_height: Some(2),
            extra_data: Bytes::new(),
        });
        let err = assert_err!(dp.decode(&a, &broken));
        assert!(matches!(err, CastError::DecoderConfigInvalid(_)));

        let session = dp.session(&a).unwrap();
        assert_eq!(session.config().unwrap().coded_width, 2);
        assert_eq!(dp.stats(&a).unwrap().rejected_configs, 1);
        assert_ok!(dp.decode(&a, &stream[1]));
    }

    #[tokio::test]
    async fn stop_decoder_leaves_other_sources_untouched() {
        let stream = encoded_stream();
        let mut dp = pipeline(true);
        let a = PeerId::from("A");
        let b = PeerId::from("B");
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        dp.init_decoder(a.clone(), tx_a).await;
        dp.init_decoder(b.clone(), tx_b).await;

        for record in &stream[..2] {
            assert_ok!(dp.decode(&a, record));
            assert_ok!(dp.decode(&b, record));
        }

        dp.stop_decoder(&a).await;
        assert!(!dp.has_decoder(&a));
        assert!(dp.has_decoder(&b));
        assert!(dp.session(&b).unwrap().config().is_some());

        assert_ok!(dp.decode(&b, &stream[2]));
        let first = rx_b.recv().await.unwrap();
        assert!(first.latency.is_some());
        let second = rx_b.recv().await.unwrap();
        assert_eq!(second.frame.data, vec![20; 16]);
        assert_eq!(dp.stats(&b).unwrap().decoded, 2);
    }

    #[tokio::test]
    async fn stop_twice_and_unknown_are_noops() {
        let mut dp = pipeline(false);
        let a = PeerId::from("A");
        dp.stop_decoder(&a).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        dp.init_decoder(a.clone(), tx).await;
        dp.stop_decoder(&a).await;
        dp.stop_decoder(&a).await;
        assert!(dp.is_empty());

        let err = dp.decode(&a, &encoded_stream()[0]).unwrap_err();
        assert!(matches!(err, CastError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn init_replaces_existing_decoder() {
        let stream = encoded_stream();
        let mut dp = pipeline(false);
        let a = PeerId::from("A");
        let (tx, _rx) = mpsc::unbounded_channel();
        dp.init_decoder(a.clone(), tx.clone()).await;
        assert_ok!(dp.decode(&a, &stream[0]));

        dp.init_decoder(a.clone(), tx).await;
        assert_eq!(dp.len(), 1);
        assert!(dp.session(&a).unwrap().config().is_none());
    }

    #[tokio::test]
    async fn stop_all_clears_everything() {
        let mut dp = pipeline(false);
        for id in ["A", "B", "C"] {
            let (tx, _rx) = mpsc::unbounded_channel();
            dp.init_decoder(PeerId::from(id), tx).await;
        }
        dp.stop_all().await;
        assert!(dp.is_empty());
    }

    /// Decoder whose flush never completes.
    struct StalledDecoder {
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl VideoDecoder for StalledDecoder {
        fn configure(&mut self, _config: &DecoderConfig) -> Result<(), CastError> {
            Ok(())
        }

        fn is_configured(&self) -> bool {
            true
        }

        fn decode(&mut self, _chunk: EncodedChunk) -> Result<(), CastError> {
            Ok(())
        }

        fn take_output(&mut self) -> Vec<DecodedFrame> {
            Vec::new()
        }

        async fn flush(&mut self) -> Result<Vec<DecodedFrame>, CastError> {
            std::future::pending().await
        }

        fn close(&mut self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct StalledCodec {
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    impl CodecBackend for StalledCodec {
        fn supports(&self, _codec: &str) -> bool {
            true
        }

        fn create_encoder(
            &self,
            settings: &EncoderSettings,
            width: u32,
            height: u32,
        ) -> Result<Box<dyn crate::media::backend::VideoEncoder>, CastError> {
            ZstdCodec::default().create_encoder(settings, width, height)
        }

        fn create_decoder(&self) -> Box<dyn VideoDecoder> {
            Box::new(StalledDecoder {
                closed: Arc::clone(&self.closed),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_decoder_returns_when_flush_stalls() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let backend = StalledCodec {
            closed: Arc::clone(&closed),
        };
        let mut dp = DecodePipeline::new(DecodeSettings::default(), Arc::new(backend));
        let (a, b) = (PeerId::from("A"), PeerId::from("B"));
        for id in [&a, &b] {
            let (tx, _rx) = mpsc::unbounded_channel();
            dp.init_decoder(id.clone(), tx).await;
        }

        let stopped = tokio::time::timeout(FLUSH_TIMEOUT * 5, dp.stop_decoder(&a)).await;
        assert!(stopped.is_ok(), "teardown must not wait on a stalled flush");
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!dp.has_decoder(&a));
        assert!(dp.has_decoder(&b));
    }
}
