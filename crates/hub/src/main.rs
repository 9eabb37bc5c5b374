mod errors;
mod state;
mod supervisor;
mod web;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use station::calibration::CalibrationStore;
use station::db::Db;
use station::guard::WateringGuard;
use station::hardware::Hardware;
use station::relay::Relay;
use station::status::StatusMarker;
use station::{config, init_tracing, shutdown_signal};

use state::{AppState, HubState};
use supervisor::{ProcessLauncher, Supervisor};

/// The logger binary is installed next to the hub.
fn default_logger_bin() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate hub executable")?;
    Ok(exe.with_file_name("greenhouse-logger"))
}

#[tokio::main]
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

    // ── Hardware (manual control and on-demand reads) ───────────────
    let hw = Hardware::open(&cfg, &Relay::ALL)?;

    // ── Logger supervision ──────────────────────────────────────────
    let logger_bin = match &cfg.supervisor.logger_bin {
        Some(path) => path.clone(),
        None => default_logger_bin()?,
    };
    let launcher = ProcessLauncher::new(&logger_bin)
        .env("CONFIG_PATH", config_path.display().to_string())
        .log_file(cfg.logger_log());
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(launcher),
        Duration::from_millis(cfg.supervisor.start_grace_ms),
    ));
    info!(logger = %logger_bin.display(), "supervisor ready");

    let events = HubState::shared();
    events.write().await.record_system("hub started".to_string());

    let app = AppState {
        db,
        hw: hw.clone(),
        supervisor: Arc::clone(&supervisor),
        calibration: CalibrationStore::new(cfg.calibration_file()),
        marker: StatusMarker::new(cfg.status_file()),
        guard: WateringGuard::new(cfg.last_watering_file()),
        events,
        stop_timeout: Duration::from_secs(cfg.supervisor.stop_timeout_sec),
    };

    // ── Web server ──────────────────────────────────────────────────
    let served = web::serve(app.clone(), cfg.web_port(), shutdown_signal()).await;
    if let Err(e) = &served {
        error!("web server error: {e:#}");
    }

    // ── Teardown ────────────────────────────────────────────────────
    if supervisor.is_running() {
        let res = app.stop_logger().await;
        if res.ok {
            info!("{}", res.msg);
        } else {
            warn!("logger stop on shutdown failed: {}", res.msg);
        }
    }
    if let Err(e) = hw.relays.all_off() {
        error!("failed to switch relays off: {e:#}");
    }
    info!("hub stopped");
    served
}
