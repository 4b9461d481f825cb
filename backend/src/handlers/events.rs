use axum::{extract::State, response::Json, routing::post, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::validate_request;
use crate::error::ApiResult;
use crate::tenant::TenantContext;
use crate::AppState;

/// Domain event raised by any CRM module (account updated, opportunity won, ...)
#[derive(Debug, Deserialize, Validate)]
pub struct DomainEventRequest {
    #[validate(length(min = 1, max = 100))]
    pub entity_type: String,
    #[validate(length(min = 1, max = 100))]
    pub event: String,
    pub entity_id: Uuid,
    #[serde(default)]
    pub snapshot: Value,
}

#[derive(Debug, Serialize)]
pub struct DomainEventResponse {
    pub executions_scheduled: usize,
}

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(publish_event))
}

async fn publish_event(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<DomainEventRequest>,
) -> ApiResult<Json<DomainEventResponse>> {
    validate_request(&req)?;

    let executions_scheduled = state
        .pipeline
        .on_domain_event(&ctx, req.entity_type.trim(), req.event.trim(), req.entity_id, &req.snapshot)
        .await;

    Ok(Json(DomainEventResponse { executions_scheduled }))
}
