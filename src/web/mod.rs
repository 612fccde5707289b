// Web server — Axum JSON admin surface over the pipeline.
//
// Every route is JSON under /api, plus /health for load balancers. There is
// no auth layer: the server is meant to sit behind whatever admin tooling
// owns authentication.

use std::sync::Arc;

use anyhow::Result;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::error::PipelineError;
use crate::pipeline::{Orchestrator, Promoter};

pub mod handlers;

/// Shared application state threaded through all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub config: Arc<Config>,
    pub orchestrator: Orchestrator,
    pub promoter: Arc<Promoter>,
}

impl AppState {
    pub fn new(config: Config, orchestrator: Orchestrator) -> Self {
        let db = orchestrator.db().clone();
        let promoter = Arc::new(Promoter::new(db.clone(), orchestrator.dedup()));
        Self {
            db,
            config: Arc::new(config),
            orchestrator,
            promoter,
        }
    }
}

/// Start the Axum web server and block until it exits.
pub async fn run_server(
    config: Config,
    db: Arc<dyn Database>,
    port: u16,
    bind: &str,
) -> Result<()> {
    let orchestrator = Orchestrator::from_config(db, &config)?;
    match orchestrator.recover_stale_runs().await {
        Ok(ids) if !ids.is_empty() => warn!(runs = ?ids, "Reconciled interrupted runs at startup"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Stale run reconciliation failed"),
    }

    let app = build_router(AppState::new(config, orchestrator));

    let addr = format!("{bind}:{port}");
    info!("Prospector admin API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/runs",
            get(handlers::runs::list_runs).post(handlers::runs::start_run),
        )
        .route("/api/runs/{id}", get(handlers::runs::get_run))
        .route("/api/runs/{id}/cancel", post(handlers::runs::cancel_run))
        .route("/api/prospects", get(handlers::prospects::list_prospects))
        .route(
            "/api/prospects/{id}/promote",
            post(handlers::prospects::promote),
        )
        .route(
            "/api/prospects/{id}/reject",
            post(handlers::prospects::reject),
        )
        .route("/api/conflicts", get(handlers::prospects::list_conflicts));

    Router::new()
        .merge(api)
        .route("/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check — always returns 200 OK.
async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({ "status": "ok" })),
    )
}

/// Typed JSON error response helper.
pub fn api_error(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
}

/// Map a pipeline error onto its HTTP status.
pub fn pipeline_error(err: PipelineError) -> Response {
    let status = match &err {
        PipelineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::RunNotFound(_) | PipelineError::ProspectNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidState { .. }
        | PipelineError::AlreadyProcessed { .. }
        | PipelineError::Conflict { .. } => StatusCode::CONFLICT,
        PipelineError::Storage(e) => {
            warn!(error = %e, "Storage error serving request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, &err.to_string())
}
