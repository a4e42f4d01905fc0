//! In-process mesh: one synthetic sharer, N viewers.
//!
//! Every participant is a [`CastNode`] driven by its own task. The
//! relay routes signaling and the [`MemoryNetwork`] carries media, so
//! the only thing missing compared to a real deployment is the wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use castwire_core::media::decoder::DecodedOutput;
use castwire_core::media::encoder::EncoderStats;
use castwire_core::signal::RoomMode;
use castwire_core::{CastNode, CodecBackend, LoopbackRelay, MemoryNetwork, PeerId, SyntheticSource, ZstdCodec};

use crate::config::NodeConfig;

/// Grace period after the last frame so in-flight records can land.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const TICK: Duration = Duration::from_millis(250);

// ── ViewerTally ──────────────────────────────────────────────────

/// Counters a viewer's output task updates as frames arrive.
#[derive(Debug, Default)]
pub struct ViewerTally {
    pub frames: AtomicU64,
    pub latency_us_total: AtomicU64,
    pub latency_us_max: AtomicU64,
}

impl ViewerTally {
    fn record(&self, output: &DecodedOutput) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = output.latency {
            let us = latency.as_micros() as u64;
            self.latency_us_total.fetch_add(us, Ordering::Relaxed);
            self.latency_us_max.fetch_max(us, Ordering::Relaxed);
        }
    }

    /// Mean latency over every frame seen so far, in microseconds.
    pub fn mean_latency_us(&self) -> u64 {
        let frames = self.frames.load(Ordering::Relaxed);
        if frames == 0 {
            return 0;
        }
        self.latency_us_total.load(Ordering::Relaxed) / frames
    }
}

/// Final numbers for one run.
#[derive(Debug, Clone, Default)]
pub struct MeshReport {
    pub encoder: EncoderStats,
    /// `(viewer, frames decoded)` in spawn order.
    pub viewers: Vec<(PeerId, u64)>,
}

// ── MeshService ──────────────────────────────────────────────────

pub struct MeshService {
    config: NodeConfig,
    shutdown: CancellationToken,
}

impl MeshService {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the mesh when cancelled (Ctrl-C handler).
    pub fn stop_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the frame limit is reached or the stop handle fires.
    pub async fn run(&self) -> Result<MeshReport, Box<dyn std::error::Error>> {
        let settings = self.config.to_node_settings();
        let backend: Arc<dyn CodecBackend> = Arc::new(ZstdCodec::default());
        let net = MemoryNetwork::new();
        let mut relay = LoopbackRelay::new();
        let mode = self.config.network.mode;
        let room = self.config.network.room.clone();

        // Sharer.
        let sharer_id = PeerId::from("sharer");
        let (outbox, mut sharer_signals) = relay.connect(sharer_id.clone());
        let (mut sharer, _sharer_decoded) = CastNode::new(
            settings.clone(),
            Arc::clone(&backend),
            Arc::new(net.factory(sharer_id.clone())),
            outbox,
        );
        sharer.join_room(room.clone(), mode, mode == RoomMode::Classic)?;

        let capture = &self.config.capture;
        let mut source = SyntheticSource::new(capture.width, capture.height, settings.encoder.framerate);
        if capture.frame_limit > 0 {
            source = source.with_limit(capture.frame_limit);
        }
        sharer.start_sharing(Box::new(source)).await?;
        let stats = sharer.encoder().stats_receiver();

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            sharer.run(&mut sharer_signals, token).await;
        }));

        // Viewers.
        let mut tallies = Vec::new();
        for i in 0..self.config.network.viewers {
            let id = PeerId::new(format!("viewer-{i}"));
            let (outbox, mut signals) = relay.connect(id.clone());
            let (mut node, decoded) = CastNode::new(
                settings.clone(),
                Arc::clone(&backend),
                Arc::new(net.factory(id.clone())),
                outbox,
            );
            node.join_room(room.clone(), mode, false)?;

            let tally = Arc::new(ViewerTally::default());
            tasks.push(tokio::spawn(count_frames(decoded, Arc::clone(&tally))));
            tallies.push((id, tally));

            let token = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                node.run(&mut signals, token).await;
            }));
        }

        tasks.push(tokio::spawn(relay.run(self.shutdown.clone())));
        info!(
            "mesh up: room {room} ({mode:?}), {} viewers",
            self.config.network.viewers
        );

        self.monitor(stats.clone(), &tallies).await;
        self.shutdown.cancel();

        for task in tasks {
            if let Err(e) = task.await {
                warn!("mesh task failed: {e}");
            }
        }

        let report = MeshReport {
            encoder: *stats.borrow(),
            viewers: tallies
                .iter()
                .map(|(id, t)| (id.clone(), t.frames.load(Ordering::Relaxed)))
                .collect(),
        };
        Ok(report)
    }

    /// Log stats periodically; return once the frame limit has been
    /// reached (plus a drain grace) or the mesh is stopped.
    async fn monitor(&self, stats: watch::Receiver<EncoderStats>, tallies: &[(PeerId, Arc<ViewerTally>)]) {
        let limit = self.config.capture.frame_limit;
        let log_every = Duration::from_secs(self.config.logging.stats_interval_secs);
        let mut since_log = Duration::ZERO;
        let mut ticker = tokio::time::interval(TICK);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let current = *stats.borrow();
            since_log += TICK;
            if !log_every.is_zero() && since_log >= log_every {
                since_log = Duration::ZERO;
                log_stats(&current, tallies);
            }

            if limit > 0 && current.submitted + current.dropped >= limit {
                debug!("frame limit {limit} reached, draining");
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(DRAIN_GRACE) => {}
                }
                log_stats(&*stats.borrow(), tallies);
                return;
            }
        }
    }
}

async fn count_frames(mut decoded: mpsc::UnboundedReceiver<DecodedOutput>, tally: Arc<ViewerTally>) {
    while let Some(output) = decoded.recv().await {
        tally.record(&output);
    }
}

fn log_stats(encoder: &EncoderStats, tallies: &[(PeerId, Arc<ViewerTally>)]) {
    info!(
        "encoder: {} submitted, {} dropped, {} keyframes",
        encoder.submitted, encoder.dropped, encoder.key_frames
    );
    for (id, tally) in tallies {
        info!(
            "{id}: {} frames, latency avg {}us max {}us",
            tally.frames.load(Ordering::Relaxed),
            tally.mean_latency_us(),
            tally.latency_us_max.load(Ordering::Relaxed)
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mesh_delivers_frames_to_every_viewer() {
        let mut config = NodeConfig::default();
        config.network.viewers = 2;
        config.capture.width = 32;
        config.capture.height = 16;
        config.capture.frame_limit = 10;
        config.encoder.framerate = 60;
        config.logging.stats_interval_secs = 0;

        let report = MeshService::new(config).run().await.unwrap();
        assert_eq!(report.encoder.submitted + report.encoder.dropped, 10);
        assert_eq!(report.viewers.len(), 2);
        assert!(report.encoder.key_frames >= 1);
        assert!(
            report.viewers.iter().all(|(_, frames)| *frames > 0),
            "every viewer decodes frames: {:?}",
            report.viewers
        );
    }

    #[tokio::test]
    async fn stop_handle_ends_unbounded_run() {
        let mut config = NodeConfig::default();
        config.network.viewers = 1;
        config.capture.width = 16;
        config.capture.height = 16;
        config.capture.frame_limit = 0;

        let service = MeshService::new(config);
        let stop = service.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.cancel();
        });
        let report = service.run().await.unwrap();
        assert_eq!(report.viewers[0].0.as_str(), "viewer-0");
    }

    #[test]
    fn tally_means() {
        let tally = ViewerTally::default();
        assert_eq!(tally.mean_latency_us(), 0);
        tally.frames.store(4, Ordering::Relaxed);
        tally.latency_us_total.store(400, Ordering::Relaxed);
        assert_eq!(tally.mean_latency_us(), 100);
    }
}
