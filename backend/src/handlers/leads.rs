//! Lead automation endpoints
//!
//! Lead CRUD lives in the CRM service; it calls `created` / `updated` here
//! after committing a write. The rest are the manual operations sales users
//! trigger from a lead record.

use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use leadflow_shared::{Lead, LeadDuplicate, MergeHistoryEntry};

use super::validate_request;
use crate::automation::scoring::ScoreBreakdown;
use crate::automation::{AssignmentOutcome, LeadAutomationOutcome};
use crate::error::{ApiResult, AppError, ValidationBuilder};
use crate::tenant::TenantContext;
use crate::AppState;

// ==================== Requests ====================

#[derive(Debug, Deserialize, Validate)]
pub struct AdjustScoreRequest {
    #[validate(range(min = -10000, max = 10000))]
    pub delta: i32,
    #[validate(length(min = 1, max = 500, message = "A reason is required"))]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct SetOwnerRequest {
    /// `null` clears the owner
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MergeRequest {
    #[validate(length(min = 1, max = 50, message = "Between 1 and 50 duplicates can be merged at once"))]
    pub duplicate_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct AdjustScoreResponse {
    pub lead_id: Uuid,
    pub score: i32,
}

#[derive(Debug, Serialize)]
pub struct AssignResponse {
    pub lead_id: Uuid,
    /// `None` when no rule matched or the matching rules had no active members
    pub assignment: Option<AssignmentOutcome>,
}

// ==================== Routes ====================

pub fn lead_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id/created", post(lead_created))
        .route("/:id/updated", post(lead_updated))
        .route("/:id/score", get(get_score))
        .route("/:id/score/adjust", post(adjust_score))
        .route("/:id/assign", post(assign_lead))
        .route("/:id/owner", put(set_owner))
        .route("/:id/duplicates/scan", post(scan_duplicates))
        .route("/:id/merge", post(merge_leads))
        .route("/:id/merge-history", get(merge_history))
}

// ==================== Handlers ====================

async fn lead_created(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LeadAutomationOutcome>> {
    let outcome = state.pipeline.on_lead_created(&ctx, id).await?;
    Ok(Json(outcome))
}

async fn lead_updated(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LeadAutomationOutcome>> {
    let outcome = state.pipeline.on_lead_updated(&ctx, id).await?;
    Ok(Json(outcome))
}

async fn get_score(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScoreBreakdown>> {
    let breakdown = state.pipeline.scoring.score_breakdown(&ctx, id, Utc::now()).await?;
    Ok(Json(breakdown))
}

async fn adjust_score(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<AdjustScoreRequest>,
) -> ApiResult<Json<AdjustScoreResponse>> {
    validate_request(&req)?;
    ValidationBuilder::new()
        .error_if(req.delta == 0, "delta", "Adjustment must not be zero")
        .error_if(req.reason.trim().is_empty(), "reason", "A reason is required")
        .finish()?;

    let score = state.pipeline.scoring.adjust_score(&ctx, id, req.delta, &req.reason).await?;
    Ok(Json(AdjustScoreResponse { lead_id: id, score }))
}

async fn assign_lead(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AssignResponse>> {
    let lead = load_lead(&state, &ctx, id).await?;
    let assignment = state.pipeline.assignment.assign(&ctx, &lead).await?;
    Ok(Json(AssignResponse { lead_id: id, assignment }))
}

async fn set_owner(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<SetOwnerRequest>,
) -> ApiResult<Json<Lead>> {
    let lead = state.pipeline.assignment.assign_manually(&ctx, id, req.user_id).await?;
    Ok(Json(lead))
}

async fn scan_duplicates(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<LeadDuplicate>>> {
    let lead = load_lead(&state, &ctx, id).await?;
    let found = state.pipeline.duplicates.find_duplicates(&ctx, &lead).await?;
    Ok(Json(found))
}

async fn merge_leads(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<MergeRequest>,
) -> ApiResult<Json<Lead>> {
    validate_request(&req)?;
    let survivor = state.merge.merge(&ctx, id, &req.duplicate_ids).await?;
    Ok(Json(survivor))
}

async fn merge_history(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<MergeHistoryEntry>>> {
    let history = state.merge.history(&ctx, id).await?;
    Ok(Json(history))
}

async fn load_lead(state: &AppState, ctx: &TenantContext, id: Uuid) -> ApiResult<Lead> {
    state
        .store
        .get_lead(ctx, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lead {}", id)))
}
