//! Axum control surface for pulls and analysis.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cohort_sync::{AnalysisService, ControllerError, JobController, SyncRuntime};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cohort-web";

#[derive(Clone)]
pub struct AppState {
    pub controller: JobController,
    pub analysis: AnalysisService,
}

impl AppState {
    pub fn new(controller: JobController, analysis: AnalysisService) -> Self {
        Self {
            controller,
            analysis,
        }
    }
}

impl From<&SyncRuntime> for AppState {
    fn from(runtime: &SyncRuntime) -> Self {
        Self::new(runtime.controller.clone(), runtime.analysis.clone())
    }
}

#[derive(Debug, Deserialize, Default)]
struct PullParams {
    target: Option<u32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/pull-data", post(pull_data_handler))
        .route("/update-analysis", post(update_analysis_handler))
        .route("/pull-status", get(pull_status_handler))
        .route("/cancel-pull", post(cancel_pull_handler))
        .route("/analysis", get(analysis_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

/// Serve until ctrl-c, running the pull scheduler alongside when configured.
pub async fn serve(runtime: SyncRuntime) -> anyhow::Result<()> {
    let port = runtime.config.web_port;
    let state = AppState::from(&runtime);

    let scheduler =
        cohort_sync::maybe_build_scheduler(&runtime.config, runtime.controller.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting pull scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "control surface listening");

    let controller = runtime.controller.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "could not listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            if controller.cancel().await {
                info!("shutdown requested; cancelling running pull");
            }
        })
        .await?;

    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler did not shut down cleanly");
        }
    }
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = cohort_sync::bootstrap(cohort_sync::PullConfig::from_env()).await?;
    serve(runtime).await
}

async fn pull_data_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PullParams>,
) -> Response {
    match state.controller.start(params.target).await {
        Ok(run) => (StatusCode::ACCEPTED, Json(run)).into_response(),
        Err(ControllerError::AlreadyRunning) => busy(),
    }
}

async fn update_analysis_handler(State(state): State<Arc<AppState>>) -> Response {
    if state.controller.is_running() {
        return busy();
    }
    match state.analysis.refresh().await {
        Ok(snapshot) => Json(snapshot.as_ref()).into_response(),
        Err(err) => {
            warn!(error = %err, "analysis refresh failed");
            server_error(err.into())
        }
    }
}

async fn pull_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.controller.status()).into_response()
}

async fn cancel_pull_handler(State(state): State<Arc<AppState>>) -> Response {
    let cancelled = state.controller.cancel().await;
    Json(json!({ "cancelled": cancelled })).into_response()
}

async fn analysis_handler(State(state): State<Arc<AppState>>) -> Response {
    let cached = state.analysis.current();
    Json(json!({
        "state": cached.state(),
        "snapshot": cached.snapshot(),
    }))
    .into_response()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

fn busy() -> Response {
    (StatusCode::CONFLICT, Json(json!({ "busy": true }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
