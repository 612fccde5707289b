// Prospect review handlers.
//
// GET  /api/prospects               — ?status= filter, ?limit= (default 50, max 500)
// POST /api/prospects/{id}/promote  — promote into the canonical store
// POST /api/prospects/{id}/reject   — reject with {"notes": "..."}
// GET  /api/conflicts               — dedup conflicts awaiting review

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::db::models::ProspectStatus;
use crate::web::{api_error, pipeline_error, AppState};

#[derive(Deserialize, Default)]
pub struct ProspectsQuery {
    /// pending | approved | rejected | converted
    pub status: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Deserialize, Default)]
pub struct RejectBody {
    #[serde(default)]
    pub notes: String,
}

#[derive(Deserialize, Default)]
pub struct ConflictsQuery {
    pub limit: Option<u32>,
}

pub async fn list_prospects(
    State(state): State<AppState>,
    Query(params): Query<ProspectsQuery>,
) -> Response {
    let status = match params.status.as_deref().map(str::parse::<ProspectStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return api_error(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let limit = params.limit.unwrap_or(50).min(500);

    match state.db.list_prospects(status, limit).await {
        Ok(prospects) => Json(serde_json::json!({
            "prospects": prospects,
            "total": prospects.len(),
        }))
        .into_response(),
        Err(e) => pipeline_error(e.into()),
    }
}

pub async fn promote(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.promoter.promote_prospect(id).await {
        Ok(profile) => Json(profile).into_response(),
        Err(e) => pipeline_error(e),
    }
}

pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<RejectBody>,
) -> Response {
    match state.promoter.reject_prospect(id, &body.notes).await {
        Ok(prospect) => Json(prospect).into_response(),
        Err(e) => pipeline_error(e),
    }
}

pub async fn list_conflicts(
    State(state): State<AppState>,
    Query(params): Query<ConflictsQuery>,
) -> Response {
    let limit = params.limit.unwrap_or(50).min(500);
    match state.db.list_conflicts(limit).await {
        Ok(conflicts) => Json(serde_json::json!({ "conflicts": conflicts })).into_response(),
        Err(e) => pipeline_error(e.into()),
    }
}
