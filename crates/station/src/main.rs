//! `greenhouse-logger`: the supervised sampling process.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};

use station::calibration::CalibrationStore;
use station::db::Db;
use station::guard::WateringGuard;
use station::hardware::Hardware;
use station::housekeeping::Housekeeping;
use station::irrigation::{IrrigationController, WateringPolicy, AUTOMATIC_RELAYS};
use station::relay::Relay;
use station::sampling::Station;
use station::status::StatusMarker;
use station::{config, init_tracing, shutdown_signal};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = config::path_from_env();
    let cfg = config::load(&config_path)?;
    std::fs::create_dir_all(&cfg.paths.data_dir)
        .with_context(|| format!("failed to create {}", cfg.paths.data_dir.display()))?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::open(&cfg.db_url()).await?;
    info!(readings = db.count_readings().await?, "db ready");

    // ── Hardware (pump only; the light belongs to the hub) ──────────
    let hw = Hardware::open(&cfg, AUTOMATIC_RELAYS)?;
    let relays = hw.relays.clone();

    // ── Status marker ───────────────────────────────────────────────
    let marker = StatusMarker::new(cfg.status_file());
    if let Err(e) = marker.mark_running(std::process::id()) {
        error!("{e:#}");
    }

    let irrigation = IrrigationController::new(
        relays.clone(),
        db.clone(),
        WateringGuard::new(cfg.last_watering_file()),
        WateringPolicy::from_config(&cfg),
    );
    let station = Station::new(
        hw,
        db,
        CalibrationStore::new(cfg.calibration_file()),
        irrigation,
        Housekeeping::from_config(&cfg),
        cfg.sample_interval(),
    );

    // ── Run until signalled ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = station.run(shutdown_rx).await;

    // ── Teardown ────────────────────────────────────────────────────
    if let Err(e) = relays.set(Relay::Pump, false) {
        error!("failed to switch pump off: {e:#}");
    }
    if let Err(e) = marker.clear() {
        error!("{e:#}");
    }
    info!("logger stopped");
    result
}
