//! Axum scheduling collaborator: queues a merge run as a background task,
//! serializes runs per target, and reports the last run's status.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ldv_pipeline::{MergeConfig, MergePipeline, MergeSummary};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ldv-web";

/// Terminal state of the most recent scheduled run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed { summary: MergeSummary },
    Failed { error: String },
}

pub struct AppState {
    config: MergeConfig,
    run_lock: Arc<Mutex<()>>,
    last_run: Mutex<Option<RunStatus>>,
}

impl AppState {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            run_lock: Arc::new(Mutex::new(())),
            last_run: Mutex::new(None),
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/merge", post(merge_handler))
        .route("/runs/latest", get(latest_run_handler))
        .with_state(state)
}

pub async fn serve(addr: &str, config: MergeConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr, "serving merge scheduler");
    axum::serve(listener, app(Arc::new(AppState::new(config)))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("LDV_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    serve(&format!("0.0.0.0:{port}"), MergeConfig::from_env()).await
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

/// Schedule one merge run. The per-target lock rejects a second run while
/// one is outstanding; callers retry after the current run finishes.
async fn merge_handler(State(state): State<Arc<AppState>>) -> Response {
    let Ok(guard) = state.run_lock.clone().try_lock_owned() else {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "a merge run is already in progress" })),
        )
            .into_response();
    };

    let job_id = Uuid::new_v4();
    let worker_state = state.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let config = worker_state.config.clone();
        let result =
            tokio::task::spawn_blocking(move || MergePipeline::new(config).run_once()).await;
        let status = match result {
            Ok(Ok(summary)) => {
                info!(run_id = %summary.run_id, "scheduled merge run completed");
                RunStatus::Completed { summary }
            }
            Ok(Err(err)) => {
                error!(error = %format!("{err:#}"), "scheduled merge run failed");
                RunStatus::Failed {
                    error: format!("{err:#}"),
                }
            }
            Err(err) => {
                error!(error = %err, "merge task aborted");
                RunStatus::Failed {
                    error: format!("merge task aborted: {err}"),
                }
            }
        };
        *worker_state.last_run.lock().await = Some(status);
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "scheduled", "job_id": job_id })),
    )
        .into_response()
}

async fn latest_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.last_run.lock().await.clone() {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no merge run recorded yet" })),
        )
            .into_response(),
    }
}
