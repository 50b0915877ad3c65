use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use stampede_core::{Engine, GroupSnapshot, Runner as _};
use stampede_metrics::MetricSeriesSummary;

#[derive(Debug, Serialize)]
pub struct Status {
    pub paused: bool,
    pub running: bool,
    pub tainted: bool,
    pub vus: u64,
    #[serde(rename = "vus-max")]
    pub vus_max: u64,
}

#[derive(Debug, Deserialize)]
pub struct StatusPatch {
    pub paused: Option<bool>,
    pub vus: Option<u64>,
    #[serde(rename = "vus-max")]
    pub vus_max: Option<u64>,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: String) -> ApiError {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn not_found(message: String) -> ApiError {
        ApiError {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

fn status_of(engine: &Engine) -> Status {
    let executor = engine.executor();
    Status {
        paused: executor.is_paused(),
        running: executor.is_running(),
        tainted: engine.is_tainted(),
        vus: executor.vus(),
        vus_max: executor.vus_max(),
    }
}

pub async fn get_status(State(engine): State<Arc<Engine>>) -> Json<Status> {
    Json(status_of(&engine))
}

/// Applies any of `paused`, `vus`, `vus-max`. The cap is raised before the
/// count so a single PATCH can lift both.
pub async fn patch_status(
    State(engine): State<Arc<Engine>>,
    Json(patch): Json<StatusPatch>,
) -> Result<Json<Status>, ApiError> {
    let executor = engine.executor();

    if let Some(vus_max) = patch.vus_max {
        executor.set_vus_max(vus_max);
    }
    if let Some(vus) = patch.vus {
        executor
            .set_vus(vus)
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
    }
    if let Some(paused) = patch.paused {
        executor.set_paused(paused);
    }

    Ok(Json(status_of(&engine)))
}

pub async fn list_metrics(
    State(engine): State<Arc<Engine>>,
) -> Json<Vec<MetricSeriesSummary>> {
    Json(engine.registry().summarize())
}

pub async fn get_metric(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<MetricSeriesSummary>>, ApiError> {
    let series = engine.registry().snapshot(&name);
    if series.is_empty() {
        return Err(ApiError::not_found(format!("no metric named `{name}`")));
    }
    Ok(Json(series))
}

pub async fn get_groups(State(engine): State<Arc<Engine>>) -> Json<GroupSnapshot> {
    Json(engine.runner().default_group().snapshot())
}
