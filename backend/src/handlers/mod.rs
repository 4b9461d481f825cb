use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use validator::Validate;

use crate::automation::conditions::validate_document;
use crate::error::{ApiResult, ValidationBuilder};
use crate::AppState;

pub mod duplicates;
pub mod events;
pub mod executions;
pub mod leads;
pub mod rules;

pub use duplicates::duplicate_routes;
pub use events::event_routes;
pub use executions::{execution_routes, job_routes};
pub use leads::lead_routes;
pub use rules::{assignment_rule_routes, scoring_rule_routes, workflow_rule_routes};

/// Everything mounted under `/api/v1`
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/leads", lead_routes())
        .nest("/duplicates", duplicate_routes())
        .nest("/scoring-rules", scoring_rule_routes())
        .nest("/assignment-rules", assignment_rule_routes())
        .nest("/workflow-rules", workflow_rule_routes())
        .nest("/workflow-executions", execution_routes())
        .nest("/events", event_routes())
        .nest("/jobs", job_routes())
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let (database, pool) = match &state.db_pool {
        Some(pool) => (
            json!(crate::database::health_check(pool).await),
            json!(crate::database::get_pool_stats(pool)),
        ),
        None => (Value::Null, Value::Null),
    };
    let healthy = database.as_bool().unwrap_or(true);

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "service": "leadflow-api",
            "store": state.config.store,
            "database": database,
            "pool": pool,
            "websocket_connections": state.ws_manager.connection_count().await,
        })),
    )
}

/// Runs the request's derive(Validate) checks.
pub(crate) fn validate_request<T: Validate>(request: &T) -> ApiResult<()> {
    request.validate()?;
    Ok(())
}

/// Adds an error on `field` when `document` is not a valid condition.
/// Null and `{}` are accepted and mean "always matches".
pub(crate) fn check_condition(builder: ValidationBuilder, field: &str, document: &Value) -> ValidationBuilder {
    if is_blank_condition(document) {
        return builder;
    }
    match validate_document(document) {
        Ok(_) => builder,
        Err(e) => builder.error(field, &e.to_string()),
    }
}

pub(crate) fn is_blank_condition(document: &Value) -> bool {
    document.is_null() || document.as_object().is_some_and(|m| m.is_empty())
}
