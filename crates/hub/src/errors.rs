use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Any unexpected failure inside a handler: 500 with `{"ok": false, "error": ..}`.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!("request failed: {:#}", self.0);
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let body = Json(json!({ "ok": false, "error": format!("{:#}", self.0) }));
        (status, body).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

/// 400 with the same body shape as [`AppError`].
pub fn bad_request(msg: impl Into<String>) -> Response {
    reject(StatusCode::BAD_REQUEST, msg)
}

pub fn reject(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "ok": false, "error": msg.into() }))).into_response()
}
