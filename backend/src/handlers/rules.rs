//! Rule administration: scoring rules, assignment rules with their members,
//! and workflow rules.
//!
//! Conditions are validated here, at save time, so the engines only ever
//! meet malformed documents written around this API. Deleting a rule only
//! deactivates it; history and executions keep pointing at it.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, put},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use leadflow_shared::{AssignmentMember, AssignmentRule, AssignmentType, ScoringRule, WorkflowRule};

use super::{check_condition, is_blank_condition, validate_request};
use crate::automation::workflow::{action_types, dispatcher};
use crate::error::{ApiResult, AppError, ValidationBuilder};
use crate::tenant::TenantContext;
use crate::AppState;

// ==================== Requests ====================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateScoringRuleRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 100))]
    pub category: String,
    pub condition: Value,
    #[validate(range(min = -1000, max = 1000))]
    pub score_delta: i32,
    #[validate(range(min = 1, max = 3650))]
    pub decay_days: Option<i32>,
    pub sort_order: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateScoringRuleRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub category: Option<String>,
    pub condition: Option<Value>,
    #[validate(range(min = -1000, max = 1000))]
    pub score_delta: Option<i32>,
    /// Zero clears the decay window
    #[validate(range(min = 0, max = 3650))]
    pub decay_days: Option<i32>,
    pub sort_order: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAssignmentRuleRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub assignment_type: AssignmentType,
    pub criteria: Option<Value>,
    #[validate(length(min = 1, max = 100))]
    pub skill_attribute: Option<String>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateAssignmentRuleRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub assignment_type: Option<AssignmentType>,
    /// `{}` clears the criteria
    pub criteria: Option<Value>,
    #[validate(length(min = 1, max = 100))]
    pub skill_attribute: Option<String>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
    #[validate(range(min = 1, max = 10000))]
    pub max_capacity: Option<i32>,
    #[validate(length(min = 1, max = 100))]
    pub skill_level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub is_active: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateWorkflowRuleRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 100))]
    pub entity_type: String,
    #[validate(length(min = 1, max = 100))]
    pub trigger_event: String,
    pub condition: Option<Value>,
    pub action_type: String,
    #[serde(default)]
    pub action_config: Value,
    #[validate(range(min = 0, max = 525600))]
    pub delay_minutes: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateWorkflowRuleRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub trigger_event: Option<String>,
    /// `{}` clears the condition
    pub condition: Option<Value>,
    pub action_type: Option<String>,
    pub action_config: Option<Value>,
    #[validate(range(min = 0, max = 525600))]
    pub delay_minutes: Option<i32>,
    pub is_active: Option<bool>,
}

const DEFAULT_MEMBER_CAPACITY: i32 = 50;

// ==================== Routes ====================

pub fn scoring_rule_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_scoring_rules).post(create_scoring_rule))
        .route(
            "/:id",
            get(get_scoring_rule).put(update_scoring_rule).delete(deactivate_scoring_rule),
        )
}

pub fn assignment_rule_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_assignment_rules).post(create_assignment_rule))
        .route(
            "/:id",
            get(get_assignment_rule)
                .put(update_assignment_rule)
                .delete(deactivate_assignment_rule),
        )
        .route("/:id/members", get(list_members).post(add_member))
        .route("/:id/members/:member_id", put(update_member))
}

pub fn workflow_rule_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workflow_rules).post(create_workflow_rule))
        .route(
            "/:id",
            get(get_workflow_rule).put(update_workflow_rule).delete(delete_workflow_rule),
        )
}

// ==================== Scoring rules ====================

fn check_scoring_condition(builder: ValidationBuilder, condition: &Value) -> ValidationBuilder {
    if is_blank_condition(condition) {
        builder.error("condition", "A scoring rule needs a condition")
    } else {
        check_condition(builder, "condition", condition)
    }
}

async fn list_scoring_rules(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> ApiResult<Json<Vec<ScoringRule>>> {
    let mut rules = state.store.list_scoring_rules(&ctx).await?;
    crate::automation::scoring::order_rules(&mut rules);
    Ok(Json(rules))
}

async fn get_scoring_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScoringRule>> {
    Ok(Json(load_scoring_rule(&state, &ctx, id).await?))
}

async fn create_scoring_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<CreateScoringRuleRequest>,
) -> ApiResult<(StatusCode, Json<ScoringRule>)> {
    validate_request(&req)?;
    check_scoring_condition(ValidationBuilder::new(), &req.condition)
        .error_if(req.score_delta == 0, "score_delta", "Score delta must not be zero")
        .finish()?;

    let rule = ScoringRule {
        id: Uuid::new_v4(),
        tenant_id: ctx.tenant_id,
        name: req.name.trim().to_string(),
        category: req.category.trim().to_string(),
        condition: req.condition,
        score_delta: req.score_delta,
        decay_days: req.decay_days,
        sort_order: req.sort_order,
        is_active: req.is_active.unwrap_or(true),
        created_by: ctx.actor_id,
        created_at: Utc::now(),
        updated_at: None,
    };
    state.store.insert_scoring_rule(&ctx, &rule).await?;

    tracing::info!(rule_id = %rule.id, category = %rule.category, "Scoring rule created");
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_scoring_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateScoringRuleRequest>,
) -> ApiResult<Json<ScoringRule>> {
    validate_request(&req)?;
    let mut builder = ValidationBuilder::new()
        .error_if(req.score_delta == Some(0), "score_delta", "Score delta must not be zero");
    if let Some(condition) = &req.condition {
        builder = check_scoring_condition(builder, condition);
    }
    builder.finish()?;

    let mut rule = load_scoring_rule(&state, &ctx, id).await?;
    if let Some(name) = req.name {
        rule.name = name.trim().to_string();
    }
    if let Some(category) = req.category {
        rule.category = category.trim().to_string();
    }
    if let Some(condition) = req.condition {
        rule.condition = condition;
    }
    if let Some(delta) = req.score_delta {
        rule.score_delta = delta;
    }
    if let Some(days) = req.decay_days {
        rule.decay_days = (days > 0).then_some(days);
    }
    if req.sort_order.is_some() {
        rule.sort_order = req.sort_order;
    }
    if let Some(active) = req.is_active {
        rule.is_active = active;
    }
    rule.updated_at = Some(Utc::now());

    state.store.update_scoring_rule(&ctx, &rule).await?;
    Ok(Json(rule))
}

async fn deactivate_scoring_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut rule = load_scoring_rule(&state, &ctx, id).await?;
    rule.is_active = false;
    rule.updated_at = Some(Utc::now());
    state.store.update_scoring_rule(&ctx, &rule).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_scoring_rule(state: &AppState, ctx: &TenantContext, id: Uuid) -> ApiResult<ScoringRule> {
    state
        .store
        .get_scoring_rule(ctx, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Scoring rule {}", id)))
}

// ==================== Assignment rules ====================

async fn list_assignment_rules(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> ApiResult<Json<Vec<AssignmentRule>>> {
    let mut rules = state.store.list_assignment_rules(&ctx).await?;
    rules.sort_by_key(|r| (r.priority, r.id));
    Ok(Json(rules))
}

async fn get_assignment_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AssignmentRule>> {
    Ok(Json(load_assignment_rule(&state, &ctx, id).await?))
}

async fn create_assignment_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<CreateAssignmentRuleRequest>,
) -> ApiResult<(StatusCode, Json<AssignmentRule>)> {
    validate_request(&req)?;
    let criteria = req.criteria.filter(|c| !is_blank_condition(c));
    let mut builder = ValidationBuilder::new();
    if let Some(criteria) = &criteria {
        builder = check_condition(builder, "criteria", criteria);
    }
    builder.finish()?;

    let rule = AssignmentRule {
        id: Uuid::new_v4(),
        tenant_id: ctx.tenant_id,
        name: req.name.trim().to_string(),
        assignment_type: req.assignment_type,
        criteria,
        skill_attribute: req.skill_attribute.map(|s| s.trim().to_string()),
        priority: req.priority.unwrap_or(100),
        last_assigned_index: -1,
        version: 0,
        is_active: req.is_active.unwrap_or(true),
        created_at: Utc::now(),
        updated_at: None,
    };
    state.store.insert_assignment_rule(&ctx, &rule).await?;

    tracing::info!(rule_id = %rule.id, assignment_type = rule.assignment_type.as_str(), "Assignment rule created");
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_assignment_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateAssignmentRuleRequest>,
) -> ApiResult<Json<AssignmentRule>> {
    validate_request(&req)?;
    let mut builder = ValidationBuilder::new();
    if let Some(criteria) = &req.criteria {
        builder = check_condition(builder, "criteria", criteria);
    }
    builder.finish()?;

    let mut rule = load_assignment_rule(&state, &ctx, id).await?;
    if let Some(name) = req.name {
        rule.name = name.trim().to_string();
    }
    if let Some(assignment_type) = req.assignment_type {
        rule.assignment_type = assignment_type;
    }
    if let Some(criteria) = req.criteria {
        rule.criteria = (!is_blank_condition(&criteria)).then_some(criteria);
    }
    if let Some(attribute) = req.skill_attribute {
        rule.skill_attribute = Some(attribute.trim().to_string());
    }
    if let Some(priority) = req.priority {
        rule.priority = priority;
    }
    if let Some(active) = req.is_active {
        rule.is_active = active;
    }
    rule.updated_at = Some(Utc::now());

    state.store.update_assignment_rule(&ctx, &rule).await?;
    // the stored cursor may have moved since we read the rule
    Ok(Json(load_assignment_rule(&state, &ctx, id).await?))
}

async fn deactivate_assignment_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut rule = load_assignment_rule(&state, &ctx, id).await?;
    rule.is_active = false;
    rule.updated_at = Some(Utc::now());
    state.store.update_assignment_rule(&ctx, &rule).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_members(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<AssignmentMember>>> {
    load_assignment_rule(&state, &ctx, id).await?;
    let members = state.store.list_members(&ctx, id, false).await?;
    Ok(Json(members))
}

async fn add_member(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<(StatusCode, Json<AssignmentMember>)> {
    validate_request(&req)?;
    load_assignment_rule(&state, &ctx, id).await?;

    let member = AssignmentMember {
        id: Uuid::new_v4(),
        tenant_id: ctx.tenant_id,
        rule_id: id,
        user_id: req.user_id,
        max_capacity: req.max_capacity.unwrap_or(DEFAULT_MEMBER_CAPACITY),
        skill_level: req.skill_level.map(|s| s.trim().to_string()),
        position: 0,
        is_active: true,
        created_at: Utc::now(),
    };
    let member = state.store.insert_member(&ctx, &member).await?;

    tracing::info!(rule_id = %id, user_id = %member.user_id, position = member.position, "Assignment member added");
    Ok((StatusCode::CREATED, Json(member)))
}

async fn update_member(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path((id, member_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateMemberRequest>,
) -> ApiResult<Json<AssignmentMember>> {
    let members = state.store.list_members(&ctx, id, false).await?;
    if !members.iter().any(|m| m.id == member_id) {
        return Err(AppError::NotFound(format!("Assignment member {}", member_id)));
    }

    state.store.set_member_active(&ctx, member_id, req.is_active).await?;

    state
        .store
        .list_members(&ctx, id, false)
        .await?
        .into_iter()
        .find(|m| m.id == member_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Assignment member {}", member_id)))
}

async fn load_assignment_rule(state: &AppState, ctx: &TenantContext, id: Uuid) -> ApiResult<AssignmentRule> {
    state
        .store
        .get_assignment_rule(ctx, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Assignment rule {}", id)))
}

// ==================== Workflow rules ====================

fn check_action(builder: ValidationBuilder, action_type: &str, action_config: &Value) -> ValidationBuilder {
    let builder = builder.error_if(
        !(action_config.is_null() || action_config.is_object()),
        "action_config",
        "Action config must be an object",
    );
    match action_types::canonical(action_type) {
        None => builder.error(
            "action_type",
            &format!("Unsupported action type, expected one of: {}", action_types::ALL.join(", ")),
        ),
        Some(action_types::SEND_WEBHOOK) => builder.error_if(
            action_config.get("url").and_then(Value::as_str).is_none_or(|u| u.trim().is_empty()),
            "action_config",
            "send_webhook needs a url",
        ),
        Some(action_types::CHANGE_STATUS | action_types::UPDATE_ENTITY_STATUS) => builder.error_if(
            action_config.get("status").and_then(Value::as_str).is_none(),
            "action_config",
            "A status change needs a status",
        ),
        Some(action_types::CREATE_FOLLOW_UP) => builder.error_if(
            dispatcher::follow_up_days(action_config).is_err(),
            "action_config",
            &format!("days_after must be between 0 and {}", dispatcher::MAX_FOLLOW_UP_DAYS),
        ),
        Some(action_types::ASSIGN_ACTIVITY) => builder.error_if(
            dispatcher::assignee(action_config).is_err(),
            "action_config",
            "assign_activity needs assign_to_user_id",
        ),
        Some(_) => builder,
    }
}

async fn list_workflow_rules(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> ApiResult<Json<Vec<WorkflowRule>>> {
    let mut rules: Vec<WorkflowRule> = state
        .store
        .list_workflow_rules(&ctx)
        .await?
        .into_iter()
        .filter(|r| !r.is_deleted)
        .collect();
    rules.sort_by_key(|r| (r.created_at, r.id));
    Ok(Json(rules))
}

async fn get_workflow_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowRule>> {
    Ok(Json(load_workflow_rule(&state, &ctx, id).await?))
}

async fn create_workflow_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(req): Json<CreateWorkflowRuleRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowRule>)> {
    validate_request(&req)?;
    let condition = req.condition.filter(|c| !is_blank_condition(c));
    let action_config = if req.action_config.is_null() {
        serde_json::json!({})
    } else {
        req.action_config
    };

    let mut builder = check_action(ValidationBuilder::new(), &req.action_type, &action_config);
    if let Some(condition) = &condition {
        builder = check_condition(builder, "condition", condition);
    }
    builder.finish()?;

    let rule = WorkflowRule {
        id: Uuid::new_v4(),
        tenant_id: ctx.tenant_id,
        name: req.name.trim().to_string(),
        entity_type: req.entity_type.trim().to_string(),
        trigger_event: req.trigger_event.trim().to_string(),
        condition,
        action_type: action_types::canonical(&req.action_type)
            .unwrap_or_default()
            .to_string(),
        action_config,
        delay_minutes: req.delay_minutes.unwrap_or(0),
        is_active: req.is_active.unwrap_or(true),
        is_deleted: false,
        created_by: ctx.actor_id,
        created_at: Utc::now(),
        updated_at: None,
    };
    state.store.insert_workflow_rule(&ctx, &rule).await?;

    tracing::info!(
        rule_id = %rule.id,
        entity_type = %rule.entity_type,
        trigger = %rule.trigger_event,
        action = %rule.action_type,
        "Workflow rule created"
    );
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_workflow_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateWorkflowRuleRequest>,
) -> ApiResult<Json<WorkflowRule>> {
    validate_request(&req)?;
    let mut rule = load_workflow_rule(&state, &ctx, id).await?;

    let action_type = req.action_type.as_deref().unwrap_or(&rule.action_type);
    let action_config = req.action_config.as_ref().unwrap_or(&rule.action_config);
    let mut builder = check_action(ValidationBuilder::new(), action_type, action_config);
    if let Some(condition) = &req.condition {
        builder = check_condition(builder, "condition", condition);
    }
    builder.finish()?;

    if let Some(action_type) = req.action_type.as_deref().and_then(action_types::canonical) {
        rule.action_type = action_type.to_string();
    }
    if let Some(config) = req.action_config {
        rule.action_config = config;
    }
    if let Some(name) = req.name {
        rule.name = name.trim().to_string();
    }
    if let Some(trigger) = req.trigger_event {
        rule.trigger_event = trigger.trim().to_string();
    }
    if let Some(condition) = req.condition {
        rule.condition = (!is_blank_condition(&condition)).then_some(condition);
    }
    if let Some(delay) = req.delay_minutes {
        rule.delay_minutes = delay;
    }
    if let Some(active) = req.is_active {
        rule.is_active = active;
    }
    rule.updated_at = Some(Utc::now());

    state.store.update_workflow_rule(&ctx, &rule).await?;
    Ok(Json(rule))
}

/// Soft delete. Pending executions of the rule fail at dispatch.
async fn delete_workflow_rule(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut rule = load_workflow_rule(&state, &ctx, id).await?;
    rule.is_active = false;
    rule.is_deleted = true;
    rule.updated_at = Some(Utc::now());
    state.store.update_workflow_rule(&ctx, &rule).await?;

    tracing::info!(rule_id = %id, actor = ?ctx.actor_id, "Workflow rule deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn load_workflow_rule(state: &AppState, ctx: &TenantContext, id: Uuid) -> ApiResult<WorkflowRule> {
    state
        .store
        .get_workflow_rule(ctx, id)
        .await?
        .filter(|r| !r.is_deleted)
        .ok_or_else(|| AppError::NotFound(format!("Workflow rule {}", id)))
}
