mod core;
mod error;
mod http;
mod logging;
mod loop_controller;
mod metadata;
mod mpv;
mod player;
mod playlist_controller;
mod scheduler;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use looper_proto::config::Config;
use looper_proto::kv::FileKvStore;
use looper_proto::store::PersistenceStore;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::{CoreEvent, SessionCore};
use crate::logging::{LogBuffer, LogBufferLayer};
use crate::mpv::{MpvEvent, MpvPlayer};
use crate::scheduler::TokioScheduler;

/// Loop a segment of a video a set number of times, or play a set list.
#[derive(Parser, Debug)]
#[command(name = "looper", version)]
struct Args {
    /// Config file (default: ~/.config/looper/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the HTTP API port
    #[arg(long)]
    port: Option<u16>,

    /// Do not start the HTTP API
    #[arg(long)]
    no_http: bool,

    /// Use mpv from PATH instead of a bundled binary
    #[arg(long)]
    use_system_deps: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    looper_proto::platform::set_use_system_deps(args.use_system_deps);

    let config_path = args.config.clone().unwrap_or_else(Config::config_path);
    let mut config = Config::load_from(&config_path)?;
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if args.no_http {
        config.http.enabled = false;
    }

    // Setup file logging + in-memory buffer for the API
    std::fs::create_dir_all(&config.storage.data_dir)
        .with_context(|| format!("creating {}", config.storage.data_dir.display()))?;
    let log_path = config.log_path();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let logs = LogBuffer::default();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(LogBufferLayer::new(logs.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,looper_daemon=debug")),
        )
        .init();

    // Print log path to stderr so the operator can tail it immediately.
    eprintln!("looper log: {}", log_path.display());
    info!("Config loaded from: {:?}", config_path);

    // Event channel: all external inputs funnel into SessionCore
    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(256);

    let store = PersistenceStore::new(FileKvStore::new(&config.storage.data_dir))
        .with_recent_cap(config.storage.recent_cap);
    let scheduler = TokioScheduler::new(event_tx.clone());
    let mut session = SessionCore::new(&config, store, scheduler, event_tx.clone());

    // mpv events are translated and forwarded into the core loop
    let (mpv_tx, mut mpv_rx) = mpsc::channel::<MpvEvent>(64);
    let forward_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(evt) = mpv_rx.recv().await {
            let Some(event) = mpv::translate(&evt) else {
                continue;
            };
            if forward_tx.send(CoreEvent::Player(event)).await.is_err() {
                break;
            }
        }
    });

    match MpvPlayer::spawn(&config.mpv, mpv_tx).await {
        Ok(player) => session.attach_player(player),
        Err(e) => error!("Failed to start mpv, running without a player: {:#}", e),
    }
    session.restore().await;

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            event_tx.clone(),
            logs,
        );
    }

    info!("looper initialised, running event loop");
    session.run(event_rx).await?;

    Ok(())
}
