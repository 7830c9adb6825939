use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use vodstream::catalog::MediaCatalog;
use vodstream::config::Settings;
use vodstream::hardware::HwAccel;
use vodstream::probe::{CachedProber, FfprobeProber};
use vodstream::process::FfmpegLauncher;
use vodstream::segments::SegmentStore;
use vodstream::{create_app, AppState};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// H.264 encoder backend (overrides config)
    #[arg(long, value_enum)]
    hw_accel: Option<HwAccel>,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = Settings::load(&args.config)?;
    info!("Configuration loaded from {}: {:?}", args.config.display(), settings);

    let encoder = settings.encoder_settings(args.hw_accel);
    info!(
        "Encoder: {} backend={:?} max_size={:?} segment_length={}s",
        encoder.ffmpeg_path.display(),
        encoder.backend,
        encoder.max_transcode_size,
        encoder.segment_length
    );

    let catalog = MediaCatalog::load(&settings.media.dir).await?;
    info!(
        "Loaded {} media files from {}",
        catalog.len(),
        settings.media.dir.display()
    );
    if catalog.is_empty() {
        warn!("Media directory contains no playable files");
    }

    let store = SegmentStore::new(&settings.cache.dir);
    let purged = store.purge_leftovers().await;
    if purged > 0 {
        info!("Purged {} half-deleted cache directories", purged);
    }
    if let Err(e) = store.watch() {
        // Waiters fall back to polling.
        warn!("Segment cache watcher unavailable: {}", e);
    }

    let prober = Arc::new(CachedProber::new(Arc::new(FfprobeProber::new(
        settings.transcoding.ffprobe_path.clone(),
    ))));
    let state = Arc::new(AppState::new(
        catalog,
        store,
        encoder,
        settings.hls_options(),
        Arc::new(FfmpegLauncher),
        prober,
    ));

    let reaper = settings.reaper().map(|(max_idle, every)| {
        info!("Stale segment reaper: idle > {:?}, every {:?}", max_idle, every);
        state.hls().spawn_reaper(max_idle, every)
    });

    let app = create_app(state.clone());
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    state.hls().supervisor().stop_all().await;
    info!("Server stopped");
    Ok(())
}
