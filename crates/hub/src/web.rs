use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::TcpListener;
use tracing::info;

use station::calibration::CalibrationUpdate;
use station::db::{parse_id_list, DeleteSelection, FilterColumn, FilterOp, Order, ReadingFilter};
use station::hardware::SensorValue;
use station::relay::{on_off, Relay};
use station::sensors::SensorKind;

use crate::errors::{bad_request, reject, AppError};
use crate::state::{AppState, RunResult};

const DEFAULT_LOG_LIMIT: u32 = 100;
const DEFAULT_RELAY_LOG_LIMIT: u32 = 50;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/run/start", post(run_start))
        .route("/api/run/stop", post(run_stop))
        .route("/api/run/status", get(run_status))
        .route("/api/logs", get(api_logs))
        .route("/api/logs/delete", post(api_logs_delete))
        .route("/api/relay_log", get(api_relay_log))
        .route("/api/relays", get(api_relays))
        .route("/api/relay/toggle", post(api_relay_toggle))
        .route("/api/sensor/read", get(api_sensor_read))
        .route("/api/calibrate", post(api_calibrate))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn api_status(State(app): State<AppState>) -> Result<Response, AppError> {
    Ok(Json(app.status().await?).into_response())
}

// -- Logger supervision -----------------------------------------------------

// Start and stop run on their own task so a client hanging up mid-request
// cannot abandon the forced-kill cleanup.

async fn run_start(State(app): State<AppState>) -> Result<Json<RunResult>, AppError> {
    let res = tokio::spawn(async move { app.start_logger().await }).await?;
    Ok(Json(res))
}

async fn run_stop(State(app): State<AppState>) -> Result<Json<RunResult>, AppError> {
    let res = tokio::spawn(async move { app.stop_logger().await }).await?;
    Ok(Json(res))
}

async fn run_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.run_status())
}

// -- Readings ---------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<u32>,
    pub order: Option<String>,
    pub column: Option<String>,
    pub op: Option<String>,
    pub value: Option<String>,
}

impl LogsQuery {
    fn order(&self) -> Result<Order, String> {
        self.order.as_deref().map_or(Ok(Order::default()), Order::from_str)
    }

    /// The three filter parameters come together or not at all.
    fn filter(&self) -> Result<Option<ReadingFilter>, String> {
        match (&self.column, &self.op, &self.value) {
            (None, None, None) => Ok(None),
            (Some(column), Some(op), Some(value)) => {
                let value: f64 = value
                    .trim()
                    .parse()
                    .map_err(|_| format!("filter value '{value}' is not a number"))?;
                if !value.is_finite() {
                    return Err(format!("filter value '{value}' is not finite"));
                }
                Ok(Some(ReadingFilter {
                    column: FilterColumn::from_str(column)?,
                    op: FilterOp::from_str(op)?,
                    value,
                }))
            }
            _ => Err("column, op and value must be given together".to_string()),
        }
    }
}

async fn api_logs(
    State(app): State<AppState>,
    Query(q): Query<LogsQuery>,
) -> Result<Response, AppError> {
    let (order, filter) = match (q.order(), q.filter()) {
        (Ok(order), Ok(filter)) => (order, filter),
        (Err(e), _) | (_, Err(e)) => return Ok(bad_request(e)),
    };
    let rows = app
        .db
        .query_readings(q.limit.unwrap_or(DEFAULT_LOG_LIMIT), order, filter)
        .await?;
    Ok(Json(rows).into_response())
}

/// `ids` is either an id-list string (`"1,3,5-7"`, or `"all"`) or a JSON
/// array of ids.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IdsField {
    Text(String),
    List(Vec<i64>),
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteRequest {
    pub ids: Option<IdsField>,
    #[serde(default)]
    pub all: bool,
}

impl DeleteRequest {
    fn selection(&self) -> Result<DeleteSelection, String> {
        match &self.ids {
            _ if self.all => Ok(DeleteSelection::All),
            Some(IdsField::Text(s)) if s.trim().eq_ignore_ascii_case("all") => {
                Ok(DeleteSelection::All)
            }
            Some(IdsField::Text(s)) => parse_id_list(s)
                .map(DeleteSelection::Ids)
                .map_err(|e| format!("{e:#}")),
            Some(IdsField::List(ids)) if !ids.is_empty() => {
                Ok(DeleteSelection::Ids(ids.iter().copied().collect::<BTreeSet<_>>()))
            }
            _ => Err("no ids given".to_string()),
        }
    }
}

async fn api_logs_delete(
    State(app): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> Result<Response, AppError> {
    let selection = match req.selection() {
        Ok(s) => s,
        Err(e) => return Ok(bad_request(e)),
    };
    let deleted = app.db.delete_readings(&selection).await?;
    app.events
        .write()
        .await
        .record_system(format!("deleted {deleted} reading(s) ({selection})"));
    Ok(Json(json!({ "ok": true, "deleted": deleted })).into_response())
}

// -- Relays -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

async fn api_relay_log(
    State(app): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Response, AppError> {
    let events = app
        .db
        .query_actuator_events(q.limit.unwrap_or(DEFAULT_RELAY_LOG_LIMIT))
        .await?;
    Ok(Json(events).into_response())
}

async fn api_relays(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.hw.relays.states())
}

/// Board number (`1`, `2`) or name (`"pump"`, `"relay2"`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RelayField {
    Number(u8),
    Name(String),
}

/// `true`/`false` or `"ON"`/`"OFF"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StateField {
    Bool(bool),
    Word(String),
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub relay: RelayField,
    pub state: Option<StateField>,
}

impl ToggleRequest {
    fn relay(&self) -> Result<Relay, String> {
        match &self.relay {
            RelayField::Number(n) => Relay::from_str(&n.to_string()),
            RelayField::Name(s) => Relay::from_str(s),
        }
    }

    fn state(&self) -> Result<Option<bool>, String> {
        match &self.state {
            None => Ok(None),
            Some(StateField::Bool(b)) => Ok(Some(*b)),
            Some(StateField::Word(w)) => match w.trim().to_ascii_uppercase().as_str() {
                "ON" | "TRUE" | "1" => Ok(Some(true)),
                "OFF" | "FALSE" | "0" => Ok(Some(false)),
                other => Err(format!("unknown relay state '{other}' (use ON/OFF)")),
            },
        }
    }
}

async fn api_relay_toggle(
    State(app): State<AppState>,
    Json(req): Json<ToggleRequest>,
) -> Result<Response, AppError> {
    let (relay, state) = match (req.relay(), req.state()) {
        (Ok(relay), Ok(state)) => (relay, state),
        (Err(e), _) | (_, Err(e)) => return Ok(bad_request(e)),
    };
    let energized = app.set_relay(relay, state).await?;
    Ok(Json(json!({ "ok": true, "relay": relay, "state": on_off(energized) })).into_response())
}

// -- Sensors and calibration ------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SensorQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

async fn api_sensor_read(
    State(app): State<AppState>,
    Query(q): Query<SensorQuery>,
) -> Response {
    let requested = q.kind.as_deref().unwrap_or("ads");
    let Some(kind) = SensorKind::parse(requested) else {
        return bad_request(format!("unknown sensor type '{requested}'"));
    };

    let Some(value) = app.hw.read(kind).await else {
        return reject(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("{requested} read failed"),
        );
    };

    let body = match value {
        SensorValue::Soil(s) => {
            let percent = app.calibration.load().moisture_percent(Some(s.voltage));
            json!({ "type": kind, "raw": s.raw, "voltage": s.voltage, "percent": percent })
        }
        SensorValue::Air(a) => {
            json!({ "type": kind, "temperature": a.temperature, "humidity": a.humidity })
        }
        SensorValue::Celsius { temperature } => json!({ "type": kind, "temperature": temperature }),
        SensorValue::Lux { lux } => json!({ "type": kind, "lux": lux }),
    };
    Json(body).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CalibrateRequest {
    pub bound: String,
    pub voltage: Option<f64>,
}

async fn api_calibrate(
    State(app): State<AppState>,
    Json(req): Json<CalibrateRequest>,
) -> Result<Response, AppError> {
    let bound = req.bound.trim().to_ascii_lowercase();
    if bound != "dry" && bound != "wet" {
        return Ok(bad_request(format!("unknown bound '{}' (dry|wet)", req.bound)));
    }

    let voltage = match req.voltage {
        Some(v) => v,
        None => match app.hw.soil.sample(app.hw.read_timeout).await {
            Some(sample) => sample.voltage,
            None => {
                return Ok(reject(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "soil probe read failed",
                ))
            }
        },
    };

    let update = if bound == "dry" {
        CalibrationUpdate {
            dry: Some(voltage),
            wet: None,
        }
    } else {
        CalibrationUpdate {
            dry: None,
            wet: Some(voltage),
        }
    };
    let calibration = app.calibration.clone();
    let profile = tokio::task::spawn_blocking(move || calibration.save(update)).await??;

    app.events
        .write()
        .await
        .record_calibration(format!("{bound} reference set to {voltage:.3} V"));
    Ok(Json(json!({
        "ok": true,
        "bound": bound,
        "voltage": voltage,
        "calibration": profile,
    }))
    .into_response())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
