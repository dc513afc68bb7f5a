//! HTTP routes for the crawler, score lookups and read-only query hooks.

use std::sync::Arc;

use admitsync_core::{CrawlMode, DiscoveredStub, JobSnapshot, LookupOutcome, Services, StartOutcome};
use admitsync_shared::{AdmitError, Institution};
use admitsync_storage::InstitutionSummary;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{ApiError, ApiResult};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/crawler/discover", get(discover))
        .route("/api/crawler/crawl/:code", post(crawl_one))
        .route("/api/crawler/crawl-all", post(crawl_all))
        .route("/api/crawler/crawl-batch", post(crawl_batch))
        .route("/api/crawler/status", get(crawl_status))
        .route("/api/crawler/stop", post(crawl_stop))
        .route("/api/scores/:number", get(score_lookup).delete(score_delete))
        .route("/api/scores/:number/refresh", post(score_refresh))
        .route("/api/scores/:number/await", get(score_await))
        .route("/api/institutions", get(institutions))
        .route("/api/institutions/:code", get(institution))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    let crawler = state.services.orchestrator.status();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "crawler": crawler.status.as_str(),
    }))
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

async fn discover(State(state): State<AppState>) -> ApiResult<Json<Vec<DiscoveredStub>>> {
    Ok(Json(state.services.crawler.discover_with_status().await?))
}

async fn crawl_one(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<Value>> {
    let code = code.trim().to_uppercase();
    if code.is_empty() {
        return Err(AdmitError::validation("institution code is required").into());
    }

    match state.services.crawler.crawl_code(&code).await {
        Ok(outcome) => Ok(Json(json!({
            "status": "ok",
            "code": code,
            "action": outcome.action,
            "program_delta": outcome.program_delta,
            "programs": outcome.institution.programs.len(),
        }))),
        Err(e @ AdmitError::Validation { .. }) => Err(e.into()),
        Err(e) => Ok(Json(json!({
            "status": "error",
            "code": code,
            "kind": e.kind(),
            "error": e.to_string(),
        }))),
    }
}

async fn crawl_all(
    State(state): State<AppState>,
    body: Option<Json<CrawlMode>>,
) -> Json<Value> {
    let mode = body.map(|Json(mode)| mode).unwrap_or_default();
    let orchestrator = &state.services.orchestrator;
    match orchestrator.start(mode) {
        StartOutcome::Started(handle) => {
            info!(job_id = %handle.job_id, ?mode, "crawl-all started over HTTP");
            Json(json!({ "status": "started", "job_id": handle.job_id }))
        }
        StartOutcome::AlreadyRunning => Json(json!({
            "status": "already_running",
            "job_id": orchestrator.status().job_id,
        })),
    }
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    codes: Vec<String>,
    #[serde(default)]
    force_update: bool,
}

async fn crawl_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<Json<Value>> {
    let codes: Vec<String> = req
        .codes
        .iter()
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .collect();
    if codes.is_empty() {
        return Err(AdmitError::validation("codes must not be empty").into());
    }

    let report = state
        .services
        .crawler
        .crawl_batch(&codes, req.force_update)
        .await?;
    Ok(Json(json!({
        "status": "completed",
        "results": report.results,
        "totals": report.totals,
        "success_rate": report.success_rate,
    })))
}

async fn crawl_status(State(state): State<AppState>) -> ApiResult<Json<JobSnapshot>> {
    Ok(Json(state.services.orchestrator.status_with_history().await?))
}

async fn crawl_stop(State(state): State<AppState>) -> Json<Value> {
    let status = if state.services.orchestrator.stop() {
        "stopping"
    } else {
        "idle"
    };
    Json(json!({ "status": status }))
}

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RegionQuery {
    region: Option<String>,
}

/// Lookup outcomes are 200 except a malformed key.
fn outcome_response(outcome: LookupOutcome) -> Response {
    let status = match outcome {
        LookupOutcome::InvalidKey { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}

async fn score_lookup(
    State(state): State<AppState>,
    Path(number): Path<String>,
    Query(q): Query<RegionQuery>,
) -> Response {
    outcome_response(state.services.lookup.lookup(&number, q.region.as_deref()).await)
}

async fn score_refresh(
    State(state): State<AppState>,
    Path(number): Path<String>,
    Query(q): Query<RegionQuery>,
) -> Response {
    outcome_response(state.services.lookup.refresh(&number, q.region.as_deref()).await)
}

async fn score_await(
    State(state): State<AppState>,
    Path(number): Path<String>,
    Query(q): Query<RegionQuery>,
) -> Response {
    outcome_response(
        state
            .services
            .lookup
            .lookup_delegated(&number, q.region.as_deref())
            .await,
    )
}

async fn score_delete(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> ApiResult<Json<Value>> {
    let removed = state.services.lookup.delete(&number).await?;
    let status = if removed { "deleted" } else { "not_found" };
    Ok(Json(json!({ "status": status, "number": number })))
}

// ---------------------------------------------------------------------------
// Query hooks
// ---------------------------------------------------------------------------

async fn institutions(State(state): State<AppState>) -> ApiResult<Json<Vec<InstitutionSummary>>> {
    Ok(Json(state.services.storage.list_institutions().await?))
}

async fn institution(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<Institution>> {
    let code = code.trim().to_uppercase();
    state
        .services
        .storage
        .get_institution(&code)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(AdmitError::NotFound(format!("institution {code}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use admitsync_shared::AppConfig;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DETAIL: &str = r#"<h1>Đại học Bách khoa Hà Nội</h1>
        <table data-year="2024">
          <tr><td>1</td><td>7480101</td><td>Khoa học máy tính</td><td>A00; A01</td><td>29.4</td></tr>
        </table>"#;

    async fn spawn_app(upstream: &MockServer) -> String {
        let mut config = AppConfig::default();
        config.source.catalog_url = format!("{}/danh-sach", upstream.uri());
        config.source.score_url_template =
            format!("{}/diem-thi?sbd={{number}}&region={{region}}", upstream.uri());
        config.source.timeout_secs = 5;
        config.browser.enabled = false;
        config.crawl.base_delay_ms = 0;
        config.crawl.jitter_ms = 0;
        config.crawl.error_delay_ms = 0;
        config.storage.db_path = std::env::temp_dir()
            .join(format!("admitsync_server_{}.db", Uuid::now_v7()))
            .to_string_lossy()
            .into_owned();

        let services = Services::from_config(&config).await.unwrap();
        let app = router(AppState {
            services: Arc::new(services),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn mount_bka(upstream: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/danh-sach"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<a href="/truong/BKA">Bách khoa</a>"#),
            )
            .mount(upstream)
            .await;
        Mock::given(method("GET"))
            .and(path("/truong/BKA"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DETAIL))
            .mount(upstream)
            .await;
    }

    #[tokio::test]
    async fn health_is_ok() {
        let upstream = MockServer::start().await;
        let base = spawn_app(&upstream).await;
        let body: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["crawler"], "idle");
    }

    #[tokio::test]
    async fn crawl_then_query_hooks() {
        let upstream = MockServer::start().await;
        mount_bka(&upstream).await;
        let base = spawn_app(&upstream).await;
        let client = reqwest::Client::new();

        let body: Value = client
            .post(format!("{base}/api/crawler/crawl/BKA"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["action"], "created");
        assert_eq!(body["program_delta"], 1);

        let list: Value = client
            .get(format!("{base}/api/institutions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list[0]["code"], "BKA");
        assert_eq!(list[0]["program_count"], 1);

        let detail = client
            .get(format!("{base}/api/institutions/BKA"))
            .send()
            .await
            .unwrap();
        assert_eq!(detail.status(), 200);

        let missing = client
            .get(format!("{base}/api/institutions/ZZZ"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        let discovered: Value = client
            .get(format!("{base}/api/crawler/discover"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(discovered[0]["exists"], true);
    }

    #[tokio::test]
    async fn crawl_all_reports_status_field() {
        let upstream = MockServer::start().await;
        mount_bka(&upstream).await;
        let base = spawn_app(&upstream).await;
        let client = reqwest::Client::new();

        let started: Value = client
            .post(format!("{base}/api/crawler/crawl-all"))
            .json(&json!({ "force_update": false, "skip_existing": true }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(started["status"], "started");
        assert!(started["job_id"].is_string());

        let mut status = Value::Null;
        for _ in 0..50 {
            status = client
                .get(format!("{base}/api/crawler/status"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if status["status"] == "completed" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(status["status"], "completed");
        assert_eq!(status["totals"]["created"], 1);
    }

    #[tokio::test]
    async fn invalid_candidate_number_is_400() {
        let upstream = MockServer::start().await;
        let base = spawn_app(&upstream).await;

        let resp = reqwest::get(format!("{base}/api/scores/00000000")).await.unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "invalid_key");

        let resp = reqwest::Client::new()
            .delete(format!("{base}/api/scores/123"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn lookup_not_found_is_200_with_status() {
        let upstream = MockServer::start().await;
        Mock::given(path("/diem-thi"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>Không tìm thấy</p>"))
            .mount(&upstream)
            .await;
        let base = spawn_app(&upstream).await;

        let resp = reqwest::get(format!("{base}/api/scores/12345678?region=ha-noi"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "not_found");
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let upstream = MockServer::start().await;
        let base = spawn_app(&upstream).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/api/crawler/crawl-batch"))
            .json(&json!({ "codes": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }
}
