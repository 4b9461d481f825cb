use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use leadflow_shared::{DuplicateStatus, LeadDuplicate};

use crate::error::ApiResult;
use crate::tenant::TenantContext;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DuplicateListQuery {
    pub status: Option<DuplicateStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveDuplicateRequest {
    /// `confirmed` or `dismissed`
    pub status: DuplicateStatus,
}

pub fn duplicate_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_duplicates))
        .route("/:id/resolve", post(resolve_duplicate))
}

async fn list_duplicates(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Query(query): Query<DuplicateListQuery>,
) -> ApiResult<Json<Vec<LeadDuplicate>>> {
    let suggestions = state.pipeline.duplicates.list_suggestions(&ctx, query.status).await?;
    Ok(Json(suggestions))
}

async fn resolve_duplicate(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveDuplicateRequest>,
) -> ApiResult<Json<LeadDuplicate>> {
    let resolved = state.pipeline.duplicates.resolve(&ctx, id, req.status).await?;
    Ok(Json(resolved))
}
