//! Admin API tests — exercise the router in-process with `oneshot`.
//!
//! Run with:
//!   cargo test --features web

#![cfg(feature = "web")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use prospector::config::Config;
use prospector::db::models::{InstagramPayload, Platform, ScrapedPayload};
use prospector::db::sqlite::SqliteDatabase;
use prospector::db::{open_sqlite_in_memory, schema, Database};
use prospector::error::SourceError;
use prospector::pacing::{RateController, SourcePolicy};
use prospector::pipeline::{Orchestrator, PipelineSettings};
use prospector::sources::{
    Candidate, DiscoveryPage, DiscoveryQuery, DiscoverySource, ProfileSource, ScrapedProfile,
    SourceKind, SourceSet,
};
use prospector::web::{build_router, AppState};

struct TwoHandles;

#[async_trait]
impl DiscoverySource for TwoHandles {
    fn kind(&self) -> SourceKind {
        SourceKind::Search
    }

    async fn discover(&self, query: &DiscoveryQuery, _page: u32) -> Result<DiscoveryPage, SourceError> {
        let candidates = ["web.one", "web.two"]
            .iter()
            .map(|h| Candidate {
                platform: query.platform,
                identifier: h.to_string(),
                country: Some(query.country.clone()),
                hit: None,
            })
            .collect();
        Ok(DiscoveryPage {
            candidates,
            next_page: None,
        })
    }
}

struct Profiles;

#[async_trait]
impl ProfileSource for Profiles {
    fn kind(&self) -> SourceKind {
        SourceKind::Instagram
    }

    async fn fetch_profile(&self, candidate: &Candidate) -> Result<ScrapedProfile, SourceError> {
        Ok(ScrapedProfile {
            platform: candidate.platform,
            handle: candidate.identifier.clone(),
            display_name: None,
            bio: None,
            avatar_url: None,
            url: None,
            followers: 12_000,
            email: None,
            payload: ScrapedPayload::Instagram(InstagramPayload {
                username: candidate.identifier.clone(),
                followers: 12_000,
                ..InstagramPayload::default()
            }),
        })
    }
}

fn app() -> (Router, Arc<dyn Database>) {
    let db = open_sqlite_in_memory().unwrap();
    (app_with(db.clone()), db)
}

fn app_with(db: Arc<dyn Database>) -> Router {
    let sources = SourceSet::new()
        .with_discovery(Arc::new(TwoHandles))
        .with_profile_source(Platform::Instagram, Arc::new(Profiles));
    let pacing = Arc::new(RateController::new(SourceKind::ALL.map(|kind| {
        (
            kind,
            SourcePolicy {
                min_interval: Duration::ZERO,
                ..SourcePolicy::defaults_for(kind)
            },
        )
    })));
    let orchestrator = Orchestrator::new(db.clone(), sources, pacing, PipelineSettings::default());
    let state = AppState::new(Config::default(), orchestrator);
    build_router(state)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn run_body(result_count: u32) -> Value {
    json!({
        "countries": ["cz"],
        "min_followers": 5000,
        "max_followers": 50000,
        "include_keywords": ["fashion"],
        "platforms": ["instagram"],
        "result_count": result_count,
    })
}

async fn wait_for_terminal(app: &Router, run_id: i64) -> Value {
    for _ in 0..200 {
        let (status, run) = send(app, "GET", &format!("/api/runs/{run_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if run["status"] == "completed" || run["status"] == "failed" {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not finish");
}

#[tokio::test]
async fn health_is_ok() {
    let (app, _) = app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn start_run_then_review_prospects() {
    let (app, _db) = app();

    let (status, body) = send(&app, "POST", "/api/runs", Some(run_body(5))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = body["run_id"].as_i64().unwrap();

    let run = wait_for_terminal(&app, run_id).await;
    assert_eq!(run["status"], "completed");
    assert_eq!(run["run_type"], "discovery");
    assert_eq!(run["total_found"], 2);
    assert_eq!(run["total_processed"], 2);
    assert_eq!(run["attempt_count"], 2);

    let (status, list) = send(&app, "GET", "/api/runs?limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["runs"].as_array().unwrap().len(), 1);

    let (status, pending) = send(&app, "GET", "/api/prospects?status=pending", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending["total"], 2);
    let ids: Vec<i64> = pending["prospects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_i64().unwrap())
        .collect();

    let (status, profile) = send(&app, "POST", &format!("/api/prospects/{}/promote", ids[0]), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["found_by"], "search_discovery");

    let (status, _) = send(&app, "POST", &format!("/api/prospects/{}/promote", ids[0]), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, rejected) = send(
        &app,
        "POST",
        &format!("/api/prospects/{}/reject", ids[1]),
        Some(json!({ "notes": "too small" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rejected["status"], "rejected");
    assert_eq!(rejected["notes"], "too small");

    // Completed runs can't be cancelled
    let (status, _) = send(&app, "POST", &format!("/api/runs/{run_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn invalid_requests_map_to_client_errors() {
    let (app, db) = app();

    let mut body = run_body(5);
    body["min_followers"] = json!(90_000);
    let (status, err) = send(&app, "POST", "/api/runs", Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(err["error"].as_str().unwrap().contains("min_followers"));
    assert!(db.list_runs(10).await.unwrap().is_empty());

    let (status, _) = send(&app, "GET", "/api/runs/404", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", "/api/prospects/404/promote", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", "/api/prospects?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, conflicts) = send(&app, "GET", "/api/conflicts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(conflicts["conflicts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn storage_failures_are_server_errors() {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    schema::create_tables(&conn).unwrap();
    conn.execute_batch(
        "DROP TABLE dedup_conflict_records;
         DROP TABLE dedup_conflicts;
         DROP TABLE scraping_runs;",
    )
    .unwrap();
    let app = app_with(Arc::new(SqliteDatabase::new(conn)));

    for uri in ["/api/runs", "/api/conflicts"] {
        let (status, body) = send(&app, "GET", uri, None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{uri}");
        assert!(body["error"].is_string(), "{uri}");
    }
}
