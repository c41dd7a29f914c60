//! Birdlens client – submits audio clips to the realtime analysis service
//! and records what it hears.
//!
//! Usage: `birdlens-client [config] <audio>...`
//!
//! The config argument may be omitted when the first argument is not a
//! `.conf` file; the default path is used then.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use birdlens_client::{AnalysisClient, ClientUpdate};
use birdlens_common::audio::AudioClip;
use birdlens_common::config::{self, Config};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── arguments + config ───────────────────────────────────────────
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = if args.first().is_some_and(|a| a.ends_with(".conf")) {
        args.remove(0)
    } else {
        Config::default_path().to_string()
    };
    if args.is_empty() {
        anyhow::bail!("usage: birdlens-client [config] <audio>...");
    }
    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Birdlens client starting (analysis={}, api={})",
        config.analysis_ws_url, config.api_base_url
    );

    // ── ctrl-c ──────────────────────────────────────────────────────
    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
        let _ = stop_tx.send(true);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── connect ─────────────────────────────────────────────────────
    let client = AnalysisClient::connect(&config)?;
    let mut updates = client.subscribe();

    if client.user().is_some() {
        if let Err(e) = client.refresh_collection().await {
            warn!("Cannot load collection: {e}");
        }
    } else {
        info!("No USER_ID/AUTH_TOKEN configured – sightings stay local");
    }

    // ── analyse each clip in turn ───────────────────────────────────
    for path in args.iter().map(PathBuf::from) {
        if SHUTDOWN.load(Ordering::Relaxed) {
            break;
        }

        let clip = match AudioClip::load(&path) {
            Ok(c) => c,
            Err(e) => {
                error!("{e:#}");
                continue;
            }
        };

        if !wait_connected(&client, &mut stop_rx).await {
            break;
        }
        if let Err(e) = client.submit(&clip.bytes, &clip.filename) {
            error!("Cannot submit {}: {e}", clip.filename);
            continue;
        }

        match wait_terminal(&mut updates, &mut stop_rx).await {
            Some(ClientUpdate::Completed(detections)) => {
                info!("{}: {} species", clip.filename, detections.len());
                for d in &detections {
                    info!("  {d}");
                }
            }
            Some(ClientUpdate::Failed(message)) => {
                error!("{}: analysis failed: {message}", clip.filename);
            }
            _ => break,
        }
    }

    // ── summary + shutdown ──────────────────────────────────────────
    client.shutdown().await;

    let ledger = client.ledger();
    if !ledger.is_empty() {
        info!("New this session (not yet collected):");
        for bird in &ledger {
            info!("  {} [{}]", bird.common_name, bird.species_code);
        }
    }
    info!("Birdlens client stopped");
    Ok(())
}

/// Wait until the link is up.  `false` if a shutdown came first.
async fn wait_connected(client: &AnalysisClient, stop: &mut watch::Receiver<bool>) -> bool {
    let mut status = client.watch_status();
    if !status.borrow().connected() {
        info!("Waiting for the analysis service…");
    }
    tokio::select! {
        result = status.wait_for(|s| s.connected()) => result.is_ok(),
        _ = stop.wait_for(|stop| *stop) => false,
    }
}

/// Wait for the current request's `Completed` or `Failed` update.
async fn wait_terminal(
    updates: &mut broadcast::Receiver<ClientUpdate>,
    stop: &mut watch::Receiver<bool>,
) -> Option<ClientUpdate> {
    loop {
        let update = tokio::select! {
            update = updates.recv() => update,
            _ = stop.wait_for(|stop| *stop) => return None,
        };
        match update {
            Ok(u @ (ClientUpdate::Completed(_) | ClientUpdate::Failed(_))) => return Some(u),
            Ok(ClientUpdate::Progress(message)) => info!("… {message}"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {n} update(s)"),
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
