//! JSON trigger surface for the sync pass, plus read-only listings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Datelike, Utc};
use congreso_core::Chamber;
use congreso_sync::{run_and_report, Orchestrator, SyncConfig, SyncPlan};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "congreso-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Where run reports go. `None` skips report writing.
    pub reports_dir: Option<PathBuf>,
    pub default_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            reports_dir: None,
            default_timeout: None,
        }
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct YearQuery {
    year: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct ChamberQuery {
    chamber: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StatusQuery {
    status: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync", post(sync_handler))
        .route("/sync/parliamentarians", post(sync_parliamentarians_handler))
        .route("/sync/bills", post(sync_bills_handler))
        .route("/parliamentarians", get(parliamentarians_handler))
        .route("/bills", get(bills_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "congreso-web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let orchestrator = congreso_sync::orchestrator_from_env(&config).await?;
    let state = AppState::new(Arc::new(orchestrator))
        .with_reports_dir(config.reports_dir.clone())
        .with_default_timeout(config.pass_timeout);
    serve(state, config.web_port).await
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn sync_handler(State(state): State<Arc<AppState>>, Query(query): Query<YearQuery>) -> Response {
    run_plan(&state, SyncPlan::full([query.year.unwrap_or_else(current_year)])).await
}

async fn sync_parliamentarians_handler(State(state): State<Arc<AppState>>) -> Response {
    run_plan(&state, SyncPlan::parliamentarians_only()).await
}

async fn sync_bills_handler(State(state): State<Arc<AppState>>, Query(query): Query<YearQuery>) -> Response {
    run_plan(&state, SyncPlan::bills_only([query.year.unwrap_or_else(current_year)])).await
}

async fn parliamentarians_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChamberQuery>,
) -> Response {
    let chamber = match query.chamber.as_deref().map(str::parse::<Chamber>).transpose() {
        Ok(chamber) => chamber,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };
    match state.orchestrator.repository().list_parliamentarians(chamber).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn bills_handler(State(state): State<Arc<AppState>>, Query(query): Query<StatusQuery>) -> Response {
    match state
        .orchestrator
        .repository()
        .list_bills(query.status.as_deref())
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Partial failures still answer 200; only a pass-wide fault is a 500.
async fn run_plan(state: &AppState, plan: SyncPlan) -> Response {
    let plan = match plan.timeout {
        Some(_) => plan,
        None => plan.with_timeout(state.default_timeout),
    };
    let result = match &state.reports_dir {
        Some(dir) => run_and_report(&state.orchestrator, plan, dir).await,
        None => state.orchestrator.run(plan).await,
    };
    match result {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => {
            warn!(error = %err, "sync pass failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn current_year() -> i32 {
    Utc::now().year()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use congreso_adapters::{CamaraClient, FixtureTransport, SenadoClient, SourceSet, Transport};
    use congreso_storage::{
        Filter, GatewayError, MemoryGateway, PersistenceGateway, Record, StoredRecord, Table,
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::path::Path;
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn fixture_sources() -> Arc<SourceSet> {
        let transport: Arc<dyn Transport> = Arc::new(FixtureTransport::new(workspace_root().join("fixtures")));
        Arc::new(
            SourceSet::new()
                .with(Arc::new(CamaraClient::new(transport.clone())))
                .with(Arc::new(SenadoClient::new(transport))),
        )
    }

    fn fixture_state() -> AppState {
        let orchestrator = Orchestrator::new(fixture_sources(), Arc::new(MemoryGateway::new()));
        AppState::new(Arc::new(orchestrator))
    }

    struct DownGateway;

    #[async_trait]
    impl PersistenceGateway for DownGateway {
        async fn upsert(&self, _table: Table, _record: Record, _key: &str) -> Result<StoredRecord, GatewayError> {
            Err(GatewayError::Unavailable("down".to_string()))
        }

        async fn select(&self, _table: Table, _filter: &Filter) -> Result<Vec<StoredRecord>, GatewayError> {
            Err(GatewayError::Unavailable("down".to_string()))
        }

        async fn delete_all(&self, _table: Table) -> Result<u64, GatewayError> {
            Err(GatewayError::Unavailable("down".to_string()))
        }
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(fixture_state());
        let (status, body) = send(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn full_sync_returns_summary_and_fills_listings() {
        let app = app(fixture_state());
        let (status, body) = send(&app, "POST", "/sync?year=2024").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["partial_failure"], false);
        assert_eq!(body["units"]["bills:2024"]["inserted"], 5);
        assert_eq!(body["units"]["parliamentarians:senado"]["inserted"], 3);

        let (status, deputies) = send(&app, "GET", "/parliamentarians?chamber=camara").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deputies.as_array().unwrap().len(), 4);

        let (_, everyone) = send(&app, "GET", "/parliamentarians").await;
        assert_eq!(everyone.as_array().unwrap().len(), 7);

        let (_, bills) = send(&app, "GET", "/bills").await;
        // 17203-15 is published by both chambers and lands on one row.
        assert_eq!(bills.as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn failed_year_is_still_a_success_response() {
        let app = app(fixture_state());
        let (status, body) = send(&app, "POST", "/sync/bills?year=2023").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["partial_failure"], true);
        assert!(body["units"]["bills:2023"]["error"].is_string());
        assert!(body["units"].get("parliamentarians:camara").is_none());
    }

    #[tokio::test]
    async fn pass_wide_failure_is_a_server_error() {
        let orchestrator = Orchestrator::new(fixture_sources(), Arc::new(DownGateway));
        let app = app(AppState::new(Arc::new(orchestrator)));
        let (status, body) = send(&app, "POST", "/sync/parliamentarians").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("parliamentarian index"));
    }

    #[tokio::test]
    async fn unknown_chamber_is_rejected() {
        let app = app(fixture_state());
        let (status, body) = send(&app, "GET", "/parliamentarians?chamber=cabildo").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn sync_writes_run_report_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(fixture_state().with_reports_dir(dir.path()));
        let (status, body) = send(&app, "POST", "/sync/parliamentarians").await;
        assert_eq!(status, StatusCode::OK);
        let run_id = body["run_id"].as_str().unwrap();
        assert!(dir.path().join(run_id).join("summary.json").exists());
    }
}
