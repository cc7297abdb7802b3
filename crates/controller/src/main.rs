//! Controller entry point: reads env config, opens the SQLite-backed
//! configuration store, seeds it from the TOML file, starts the
//! supervisor (scheduler + pump executors + manual path) and the JSON
//! API, then waits for a shutdown signal.
//!
//! Safety features:
//! - Signal handler: SIGTERM/SIGINT → in-flight jobs truncated through
//!   the safety shutdown path (zone off, settle, lock off)
//! - Per-pump lock entity held for the whole actuation sequence
//! - Stuck locks force-released after a configurable timeout
//! - Host writes retried with bounded exponential backoff

mod calculator;
mod clock;
mod config;
mod db;
mod executor;
mod host;
mod manual;
mod scheduler;
mod store;
mod supervisor;
mod web;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::env;
use tracing::{info, warn};

use clock::SystemClock;
use db::Db;
use host::HostClient;
use store::ConfigStore;
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    let filter = env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| tracing_subscriber::EnvFilter::try_new(level).ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ── Env config ──────────────────────────────────────────────────
    let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let base_url =
        env::var("HOST_BASE_URL").unwrap_or_else(|_| "http://supervisor/core/api".to_string());
    let token = env::var("HOST_SUPERVISOR_TOKEN").context("HOST_SUPERVISOR_TOKEN must be set")?;
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Configuration store ─────────────────────────────────────────
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir '{data_dir}'"))?;
    let db = Db::connect(&format!("sqlite:{data_dir}/irrigation.db?mode=rwc")).await?;
    db.migrate().await?;
    let store = ConfigStore::new(db);

    if Path::new(&config_path).exists() {
        let cfg = config::load(&config_path)?;
        config::apply(&cfg, &store).await?;
    } else {
        warn!(path = %config_path, "no seed config file, using stored configuration");
    }

    let snap = store.snapshot().await?;
    if snap.pumps.is_empty() {
        warn!("no pumps configured");
    }
    info!(
        rooms = snap.rooms.len(),
        pumps = snap.pumps.len(),
        zones = snap.zones.len(),
        events = snap.events.len(),
        "configuration loaded"
    );

    // ── Host client ─────────────────────────────────────────────────
    let host = HostClient::new(&base_url, &token)?;

    // ── Supervisor: scheduler, pump executors, manual path ──────────
    let supervisor = Arc::new(Supervisor::start(store, host, SystemClock));

    // ── JSON API ────────────────────────────────────────────────────
    let web_supervisor = Arc::clone(&supervisor);
    tokio::spawn(async move {
        web::serve(web_supervisor).await;
    });

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason = tokio::select! {
        _ = &mut ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down");
    supervisor.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
