//! parkwatch: scheduled parking-space occupancy capture from NVR
//! replay streams, with change inference and an on-demand HLS gateway.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use parkwatch_config_data::{parse_config_file, ParkwatchConfig};
use parkwatch_detect::Detector;
use parkwatch_engine::{change, EngineConfig, ExecutionEngine, Scheduler};
use parkwatch_frame_source::FfmpegFrameSource;
use parkwatch_hls::{FfmpegTranscoder, HlsConfig, HlsManager};
use parkwatch_store::{BlobStore, Store};

mod detector;
mod logging;
mod webapi;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct ParkwatchCliArgs {
    /// Configuration file. Defaults apply when omitted.
    #[arg(env = "PARKWATCH_CONFIG")]
    config_file: Option<std::path::PathBuf>,
    /// Override the configured HTTP listen address.
    #[arg(long, env = "PARKWATCH_LISTEN")]
    listen_addr: Option<String>,
    /// Also log to this file.
    #[arg(long)]
    log_file: Option<std::path::PathBuf>,
}

fn main() -> Result<()> {
    let args = ParkwatchCliArgs::parse();
    logging::initiate_logging(args.log_file.as_ref())
        .map_err(|e| eyre::eyre!("logging setup failed: {e}"))?;
    debug!("{args:?}");

    let mut cfg = match &args.config_file {
        Some(path) => parse_config_file(path)
            .wrap_err_with(|| format!("reading config file {}", path.display()))?,
        None => ParkwatchConfig::default(),
    };
    if let Some(listen) = args.listen_addr {
        cfg.http_listen_addr = listen;
    }
    debug!("{cfg:?}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("parkwatch-runtime")
        .build()?;
    runtime.block_on(run(cfg))
}

async fn run(cfg: ParkwatchConfig) -> Result<()> {
    let zone = cfg.wall_timezone().wrap_err("bad wall_timezone")?;
    if cfg.reference_width != parkwatch_types::REFERENCE_WIDTH
        || cfg.reference_height != parkwatch_types::REFERENCE_HEIGHT
    {
        eyre::bail!(
            "reference frame {}x{} is not supported (expected {}x{})",
            cfg.reference_width,
            cfg.reference_height,
            parkwatch_types::REFERENCE_WIDTH,
            parkwatch_types::REFERENCE_HEIGHT,
        );
    }

    if let Some(parent) = cfg.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Store::open(&cfg.db_path).wrap_err("opening store")?);
    let blobs = Arc::new(BlobStore::new(&cfg.blob_root).wrap_err("opening blob root")?);

    let frames = Arc::new(FfmpegFrameSource::new(cfg.ffmpeg_path.clone()));
    let det: Arc<dyn Detector> = match &cfg.detector_url {
        Some(url) => {
            info!("occupancy detection via {url}");
            Arc::new(detector::HttpDetector::new(url.clone()))
        }
        None => {
            warn!("no detector_url configured; every space will report unknown");
            Arc::new(detector::DisabledDetector)
        }
    };

    let engine_cfg = EngineConfig {
        max_combo_concurrency: cfg.max_combo_concurrency,
        max_workers_per_combo: cfg.max_workers_per_combo,
        rtsp_connect_timeout: Duration::from_secs(cfg.task_rtsp_connect_timeout_sec),
        task_retry_count: cfg.task_retry_count,
        task_deadline_factor: cfg.task_deadline_factor,
        wall_timezone: zone,
        ..EngineConfig::default()
    };

    let (change_tx, change_rx) = tokio::sync::mpsc::channel(256);
    let change_handle = change::start(store.clone(), change_rx);

    let engine = ExecutionEngine::new(
        store.clone(),
        blobs.clone(),
        frames,
        det,
        change_tx,
        engine_cfg.clone(),
    );
    let scheduler = Scheduler::new(store.clone(), engine.clone(), engine_cfg);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loops = scheduler.spawn_loops(shutdown_rx.clone());

    let hls = HlsManager::new(
        HlsConfig {
            hls_root: cfg.hls_root.clone(),
            idle_timeout: Duration::from_secs(cfg.hls_idle_timeout_sec),
            ..HlsConfig::default()
        },
        Arc::new(FfmpegTranscoder::new(cfg.ffmpeg_path.clone())),
    )
    .wrap_err("opening hls root")?;
    let hls_reaper = hls.spawn_reaper(shutdown_rx);

    let state = webapi::AppState {
        store,
        blobs,
        scheduler,
        hls,
    };
    let router = webapi::router(state, &cfg.hls_root, &cfg.blob_root);

    let listener = tokio::net::TcpListener::bind(&cfg.http_listen_addr)
        .await
        .wrap_err_with(|| format!("binding {}", cfg.http_listen_addr))?;
    info!("parkwatch API at http://{}/", listener.local_addr()?);

    let serve_future = {
        use std::future::IntoFuture;
        axum::serve(listener, router).into_future()
    };
    tokio::select! {
        result = serve_future => {
            result.wrap_err("http server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c; draining");
        }
    }

    // Cooperative drain: stop the loops, give in-flight captures their
    // grace period, kill transcoder children.
    let _ = shutdown_tx.send(true);
    engine.shutdown().await;
    for handle in loops {
        let _ = handle.await;
    }
    let _ = hls_reaper.await;
    drop(engine);
    let _ = change_handle.await;
    info!("parkwatch stopped");
    Ok(())
}
