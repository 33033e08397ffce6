// src/main.rs

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};

use frame_relay::api::{self, ApiState};
use frame_relay::config::Config;
use frame_relay::recorder::FfmpegEncoder;
use frame_relay::relay::RelayEngine;
use frame_relay::upstream::WsUpstream;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // ------------------------------------------------------------
    // Config
    // ------------------------------------------------------------
    let cfg_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "relay.toml".into()),
    );

    let (mut cfg, from_file) = Config::load_or_default(&cfg_path)?;
    if from_file {
        info!("[relay] loaded {}", cfg_path.display());
    } else {
        warn!("[relay] {} not found, using defaults", cfg_path.display());
    }
    cfg.apply_env().context("environment override")?;
    cfg.validate().context("config validation failed")?;

    let bind: SocketAddr = format!("{}:{}", cfg.server.host_ip, cfg.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cfg.server.host_ip, cfg.server.port))?;

    // ------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------
    let upstream = Arc::new(WsUpstream::new(cfg.source.connect_timeout()));
    let encoder = Arc::new(FfmpegEncoder::from_config(&cfg.recording));

    let recordings_dir = cfg.recording.dir_path();
    std::fs::create_dir_all(&recordings_dir)
        .with_context(|| format!("creating recordings dir {}", recordings_dir.display()))?;
    let static_dir = PathBuf::from(&cfg.server.static_dir);
    let (relay, engine) = RelayEngine::spawn(
        cfg,
        upstream,
        encoder,
        from_file.then_some(cfg_path),
    );

    // ------------------------------------------------------------
    // HTTP
    // ------------------------------------------------------------
    let state = ApiState {
        relay: relay.clone(),
        recordings_dir,
        static_dir,
    };

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("[relay] shutdown requested"),
            Err(err) => {
                error!("[relay] cannot listen for ctrl-c: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    let served = api::serve(bind, state, shutdown).await;

    relay.shutdown().await;
    if let Err(err) = engine.await {
        error!("[relay] engine task failed: {}", err);
    }

    served
}
