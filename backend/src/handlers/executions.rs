use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use leadflow_shared::{ExecutionStatus, WorkflowExecution};

use crate::error::ApiResult;
use crate::jobs::JobExecutionLog;
use crate::tenant::TenantContext;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecutionListQuery {
    pub status: Option<ExecutionStatus>,
    pub limit: Option<i64>,
}

pub fn execution_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_executions))
        .route("/:id/retry", post(retry_execution))
}

pub fn job_routes() -> Router<Arc<AppState>> {
    Router::new().route("/logs", get(job_logs))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Query(query): Query<ExecutionListQuery>,
) -> ApiResult<Json<Vec<WorkflowExecution>>> {
    let executions = state
        .pipeline
        .workflow
        .list_executions(&ctx, query.status, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(executions))
}

/// Queues a new pending execution copied from a failed one
async fn retry_execution(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowExecution>> {
    let retry = state.pipeline.workflow.retry_execution(&ctx, id).await?;
    Ok(Json(retry))
}

/// Recent background job runs, newest last. Not tenant scoped.
async fn job_logs(State(state): State<Arc<AppState>>) -> Json<Vec<JobExecutionLog>> {
    Json(state.job_logs.read().await.clone())
}
