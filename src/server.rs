//! HTTP API for report execution and schedule control.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/reports/run` | Execute an ad-hoc retrieval + projection |
//! | `POST` | `/reports/{id}/run` | Execute a saved report |
//! | `POST` | `/schedules/reload` | Rebuild the active job set from the store |
//! | `GET`  | `/schedules/active` | List registered jobs with their next fire time |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "missing_query_text", "message": "missing query text for source warehouse" } }
//! ```
//!
//! Codes come from [`ReportError::code`], plus `bad_request` for malformed
//! request bodies.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::ReportError;
use crate::models::{ProjectionSpec, RetrievalSpec, TabularResult};
use crate::pipeline::ReportPipeline;
use crate::scheduler::{ActiveJob, HandlerRegistry, Scheduler};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ReportPipeline>,
    pub scheduler: Arc<Scheduler>,
}

/// Build the router over existing state. Used by [`run_server`] and tests.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/reports/run", post(handle_run_adhoc))
        .route("/reports/{id}/run", post(handle_run_report))
        .route("/schedules/reload", post(handle_reload))
        .route("/schedules/active", get(handle_active))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server with the built-in task handlers.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    run_server_with_handlers(config, HandlerRegistry::with_builtins()).await
}

/// Starts the HTTP server with a caller-supplied handler registry.
///
/// The scheduler is initialized before the listener binds (when
/// `[scheduler].enabled`), and on Ctrl-C the server drains, the scheduler
/// stops, and every pooled connection is released.
pub async fn run_server_with_handlers(
    config: &Config,
    handlers: HandlerRegistry,
) -> anyhow::Result<()> {
    let pipeline = Arc::new(ReportPipeline::open(config).await?);
    let scheduler = Arc::new(Scheduler::new(pipeline.clone(), handlers));

    if config.scheduler.enabled {
        scheduler.init().await;
    } else {
        tracing::info!("scheduler disabled by configuration");
    }

    let state = AppState {
        pipeline: pipeline.clone(),
        scheduler: scheduler.clone(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Report server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    let released = pipeline.connections().release_all().await;
    tracing::info!(released, "connections released");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<ReportError> for AppError {
    fn from(err: ReportError) -> Self {
        let status = match &err {
            ReportError::SourceNotFound(_) | ReportError::ReportNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ReportError::MissingQueryText { .. }
            | ReportError::SheetNotFound(_)
            | ReportError::DescriptorMismatch { .. }
            | ReportError::UnsupportedSourceKind(_)
            | ReportError::InvalidCronExpression { .. } => StatusCode::BAD_REQUEST,
            ReportError::SourceFileMissing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReportError::Connection { .. } | ReportError::Retrieval(_) => StatusCode::BAD_GATEWAY,
            ReportError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /reports/run ============

/// Request body for `POST /reports/run`.
#[derive(Debug, Deserialize)]
pub struct AdhocRequest {
    pub retrieval: RetrievalSpec,
    #[serde(default)]
    pub projection: ProjectionSpec,
}

async fn handle_run_adhoc(
    State(state): State<AppState>,
    body: Result<Json<AdhocRequest>, JsonRejection>,
) -> Result<Json<TabularResult>, AppError> {
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;
    if req.retrieval.source_id.trim().is_empty() {
        return Err(bad_request("retrieval.source_id must not be empty"));
    }
    let result = state
        .pipeline
        .run_adhoc(&req.retrieval, &req.projection)
        .await?;
    Ok(Json(result))
}

// ============ POST /reports/{id}/run ============

async fn handle_run_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TabularResult>, AppError> {
    let result = state.pipeline.run_report(&id).await?;
    Ok(Json(result))
}

// ============ Schedules ============

#[derive(Serialize)]
struct JobsResponse {
    active: usize,
    jobs: Vec<ActiveJob>,
}

async fn handle_reload(State(state): State<AppState>) -> Json<JobsResponse> {
    let active = state.scheduler.notify_change().await;
    let jobs = state.scheduler.active_job_details().await;
    Json(JobsResponse { active, jobs })
}

async fn handle_active(State(state): State<AppState>) -> Json<JobsResponse> {
    let jobs = state.scheduler.active_job_details().await;
    Json(JobsResponse {
        active: jobs.len(),
        jobs,
    })
}
