//! Castwire node: entry point.
//!
//! ```text
//! castwire-node                  Run the mesh with castwire-node.toml
//! castwire-node --config <path>  Load a custom config TOML
//! castwire-node --gen-config     Write default config to stdout
//! castwire-node --viewers 4      Override the number of viewers
//! castwire-node --frames 0       Stream until Ctrl-C
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use castwire_node::config::NodeConfig;
use castwire_node::mesh::MeshService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "castwire-node", about = "In-process screen-share mesh over the castwire transport")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "castwire-node.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to `--config` and exit.
    #[arg(long)]
    init_config: bool,

    /// Number of viewers (overrides the config file).
    #[arg(long)]
    viewers: Option<u32>,

    /// Frames to stream before exiting, 0 for no limit (overrides the config file).
    #[arg(long)]
    frames: Option<u64>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&NodeConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    if cli.init_config {
        NodeConfig::write_default(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    // Load config.
    let mut config = NodeConfig::load(&cli.config);
    if let Some(viewers) = cli.viewers {
        config.network.viewers = viewers;
    }
    if let Some(frames) = cli.frames {
        config.capture.frame_limit = frames;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("castwire-node v{}", env!("CARGO_PKG_VERSION"));
    info!("room: {} ({:?})", config.network.room, config.network.mode);
    info!(
        "capture: {}x{} @ {} fps, codec {}",
        config.capture.width, config.capture.height, config.encoder.framerate, config.encoder.codec
    );
    info!("viewers: {}", config.network.viewers);

    let service = MeshService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    let report = service.run().await?;
    info!(
        "done: {} frames encoded, {} dropped, {} keyframes",
        report.encoder.submitted, report.encoder.dropped, report.encoder.key_frames
    );
    for (viewer, frames) in &report.viewers {
        info!("{viewer}: {frames} frames decoded");
    }

    Ok(())
}
