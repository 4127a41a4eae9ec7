//! Thin axum trigger and read API over the ingestion pipeline.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ctsync_core::{RunRequest, MAX_RECORDS_PER_RUN};
use ctsync_storage::Collection;
use ctsync_sync::{
    filesystem_view, find_trials, load_default_conditions, maybe_build_scheduler, trial_markdown,
    SyncConfig, SyncPipeline, DEFAULT_LIST_LIMIT,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "ctsync-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize)]
struct CrawlBody {
    condition: String,
    #[serde(default)]
    max_trials: Option<usize>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    enrich_with_firecrawl: bool,
    #[serde(default)]
    force_refresh: bool,
}

impl CrawlBody {
    fn into_request(self) -> RunRequest {
        let mut request = RunRequest::new(self.condition)
            .with_enrichment(self.enrich_with_firecrawl)
            .with_force_refresh(self.force_refresh);
        if let Some(max) = self.max_trials {
            request = request.with_max_records(max);
        }
        if let Some(status) = self.status.filter(|s| !s.trim().is_empty()) {
            request = request.with_status(status);
        }
        request
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    condition: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/trials", get(list_trials_handler))
        .route("/api/trials/crawl", post(crawl_handler))
        .route("/api/trials/filesystem/{condition}", get(filesystem_handler))
        .route("/api/trials/{nct_id}", get(trial_handler))
        .route("/api/trials/{nct_id}/markdown", get(markdown_handler))
        .with_state(Arc::new(state))
}

/// Serve on `CTSYNC_WEB_PORT`, starting the cron scheduler when enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(ctsync_sync::build_pipeline_from_env(&config).await?);

    let scheduler = if config.scheduler_enabled {
        let conditions = load_default_conditions(&config.workspace_root).await?;
        maybe_build_scheduler(&config, pipeline.clone(), conditions, RunRequest::new("")).await?
    } else {
        None
    };
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn crawl_handler(State(state): State<Arc<AppState>>, Json(body): Json<CrawlBody>) -> Response {
    let request = body.into_request();
    match state.pipeline.run_once(&request).await {
        Ok(stats) => Json(json!({"success": true, "stats": stats})).into_response(),
        Err(err) => {
            error!(condition = %request.condition, error = %err, "crawl request failed");
            server_error(err)
        }
    }
}

async fn list_trials_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_RECORDS_PER_RUN);
    match find_trials(
        state.pipeline.trials().as_ref(),
        params.condition.as_deref(),
        params.status.as_deref(),
        limit,
    )
    .await
    {
        Ok(trials) => Json(json!({"success": true, "count": trials.len(), "trials": trials})).into_response(),
        Err(err) => server_error(err),
    }
}

async fn trial_handler(State(state): State<Arc<AppState>>, Path(nct_id): Path<String>) -> Response {
    match state.pipeline.trials().find_by_key(&nct_id).await {
        Ok(Some(trial)) => Json(json!({"success": true, "trial": trial})).into_response(),
        Ok(None) => not_found(&nct_id),
        Err(err) => server_error(err),
    }
}

async fn markdown_handler(State(state): State<Arc<AppState>>, Path(nct_id): Path<String>) -> Response {
    match trial_markdown(state.pipeline.trials().as_ref(), &nct_id).await {
        Ok(Some(markdown)) => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            markdown,
        )
            .into_response(),
        Ok(None) => not_found(&nct_id),
        Err(err) => server_error(err),
    }
}

async fn filesystem_handler(
    State(state): State<Arc<AppState>>,
    Path(condition): Path<String>,
) -> Response {
    match filesystem_view(state.pipeline.trials().as_ref(), &condition).await {
        Ok(view) => Json(json!({
            "success": true,
            "condition": condition,
            "trial_count": view.len(),
            "filesystem": view,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

fn not_found(nct_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "detail": format!("Trial {nct_id} not found")})),
    )
        .into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "detail": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use ctsync_core::{CrawlStateEntry, TrialDocument};
    use ctsync_registry::{PageQuery, RawRecord, RegistryPage, RegistrySource};
    use ctsync_storage::{FetchError, MemoryCollection};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    struct OnePageRegistry {
        fail: bool,
    }

    #[async_trait]
    impl RegistrySource for OnePageRegistry {
        async fn fetch_page(&self, _query: &PageQuery<'_>) -> Result<RegistryPage, FetchError> {
            if self.fail {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    url: "http://registry.test/studies".into(),
                });
            }
            let records = ["NCT100", "NCT200"]
                .iter()
                .map(|id| {
                    RawRecord(json!({
                        "protocolSection": {
                            "identificationModule": {"nctId": id, "briefTitle": format!("Trial {id}")},
                            "statusModule": {
                                "overallStatus": "RECRUITING",
                                "lastUpdateSubmitDate": "2024-06-01"
                            },
                            "designModule": {"phases": ["PHASE3"]}
                        }
                    }))
                })
                .collect();
            Ok(RegistryPage {
                records,
                next_page_token: None,
                total_count: 2,
            })
        }
    }

    fn test_app(fail: bool) -> Router {
        let trials = Arc::new(MemoryCollection::<TrialDocument>::new());
        let crawl_index = Arc::new(MemoryCollection::<CrawlStateEntry>::new());
        let pipeline = SyncPipeline::new(Arc::new(OnePageRegistry { fail }), trials, crawl_index);
        app(AppState::new(Arc::new(pipeline)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, String) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn crawl_body() -> Value {
        json!({"condition": "Lung Cancer", "max_trials": 10})
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app(false);
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn crawl_then_read_back() {
        let app = test_app(false);
        let (status, body) = send(&app, "POST", "/api/trials/crawl", Some(crawl_body())).await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["stats"]["new_trials"], 2);

        let (status, body) = send(&app, "POST", "/api/trials/crawl", Some(crawl_body())).await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["stats"]["skipped_trials"], 2);

        let (status, body) = send(&app, "GET", "/api/trials?condition=lung&limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["count"], 2);
        assert_eq!(value["trials"][0]["condition"], "lung_cancer");

        let (status, body) = send(&app, "GET", "/api/trials/NCT100", None).await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["trial"]["nct_id"], "NCT100");
        assert_eq!(value["trial"]["normalized_phase"], "phase3");
        assert!(value["trial"]["created_at"].is_string());
    }

    #[tokio::test]
    async fn markdown_and_filesystem_views() {
        let app = test_app(false);
        send(&app, "POST", "/api/trials/crawl", Some(crawl_body())).await;

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/trials/NCT200/markdown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/markdown"));
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8(bytes.to_vec()).unwrap().starts_with("# Trial: NCT200"));

        let (status, body) = send(&app, "GET", "/api/trials/filesystem/lung_cancer", None).await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["trial_count"], 2);
        assert!(value["filesystem"]["trials/lung_cancer/phase3/NCT100.md"].is_string());
    }

    #[tokio::test]
    async fn unknown_trial_is_404() {
        let app = test_app(false);
        let (status, _) = send(&app, "GET", "/api/trials/NCT999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", "/api/trials/NCT999/markdown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fatal_run_error_is_500() {
        let app = test_app(true);
        let (status, body) = send(&app, "POST", "/api/trials/crawl", Some(crawl_body())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["success"], false);
        assert!(value["detail"].as_str().unwrap().contains("registry fetch failed"));
    }
}
