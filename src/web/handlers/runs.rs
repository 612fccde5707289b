// Run handlers.
//
// POST /api/runs              — validate and start a run (202 + run_id)
// GET  /api/runs              — recent runs, ?limit= (default 20, max 200)
// GET  /api/runs/{id}         — status snapshot with recent attempts
// POST /api/runs/{id}/cancel  — cancel a running run

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::db::models::{RunType, ScrapingConfig};
use crate::pipeline::RunRequest;
use crate::web::{pipeline_error, AppState};

fn default_run_type() -> RunType {
    RunType::Discovery
}

#[derive(Deserialize)]
pub struct StartRunBody {
    #[serde(default = "default_run_type")]
    pub run_type: RunType,
    #[serde(flatten)]
    pub config: ScrapingConfig,
    /// Refresh runs only: restrict to profiles with these `found_by` tags.
    #[serde(default)]
    pub source_filter: Vec<String>,
}

#[derive(Deserialize, Default)]
pub struct RunsQuery {
    pub limit: Option<u32>,
}

pub async fn start_run(State(state): State<AppState>, Json(body): Json<StartRunBody>) -> Response {
    let request = RunRequest {
        config: body.config,
        run_type: body.run_type,
        source_filter: body.source_filter,
    };
    match state.orchestrator.start_run(request).await {
        Ok(handle) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "run_id": handle.run_id })),
        )
            .into_response(),
        Err(e) => pipeline_error(e),
    }
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<RunsQuery>,
) -> Response {
    let limit = params.limit.unwrap_or(20).min(200);
    match state.db.list_runs(limit).await {
        Ok(runs) => Json(serde_json::json!({ "runs": runs })).into_response(),
        Err(e) => pipeline_error(e.into()),
    }
}

pub async fn get_run(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.orchestrator.run_status(id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => pipeline_error(e),
    }
}

pub async fn cancel_run(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.orchestrator.cancel_run(id).await {
        Ok(()) => Json(serde_json::json!({ "run_id": id, "status": "cancelled" })).into_response(),
        Err(e) => pipeline_error(e),
    }
}
