use crate::metrics;
use crate::model::TelemetryFrame;
use crate::readings::{ConnectionStatus, LatestReadings, UnitSnapshot};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct AppState {
    readings: Arc<LatestReadings>,
}

pub fn create_router(readings: Arc<LatestReadings>) -> Router {
    let state = AppState { readings };

    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/units", get(get_units))
        .route("/api/v1/units/:id", get(get_unit))
        .route("/api/v1/server", get(get_server))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> Json<ConnectionStatus> {
    Json(state.readings.status())
}

async fn get_units(State(state): State<AppState>) -> Json<Vec<UnitSnapshot>> {
    Json(state.readings.units())
}

async fn get_unit(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<UnitSnapshot>, AppError> {
    state
        .readings
        .unit(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("unit {} not found", id)))
}

async fn get_server(State(state): State<AppState>) -> Result<Json<TelemetryFrame>, AppError> {
    state
        .readings
        .server()
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no server monitor data yet".to_string()))
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

#[derive(Debug)]
enum AppError {
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(message) => {
                debug!("API not found: {}", message);
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
        }
    }
}
