//! Workflow action execution.
//!
//! The worker only knows an action type and its opaque config; everything
//! about performing the action lives behind [`ActionDispatcher`].

use async_trait::async_trait;
use chrono::{Duration, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use leadflow_shared::{Activity, EntityRef, LeadStatus, OpportunityStatus, entity_types};

use crate::automation::conditions::field_value;
use crate::automation::notifier::{ChangeEvent, ChangeNotifier, notify_quietly};
use crate::store::{SharedStore, StoreError};
use crate::tenant::TenantContext;

pub mod action_types {
    pub const CREATE_TASK: &str = "create_task";
    pub const CREATE_FOLLOW_UP: &str = "create_follow_up";
    pub const SEND_NOTIFICATION: &str = "send_notification";
    pub const CHANGE_STATUS: &str = "change_status";
    pub const ARCHIVE: &str = "archive";
    pub const SEND_WEBHOOK: &str = "send_webhook";
    pub const UPDATE_ENTITY_STATUS: &str = "update_entity_status";
    pub const ASSIGN_ACTIVITY: &str = "assign_activity";

    pub const ALL: [&str; 8] = [
        CREATE_TASK,
        CREATE_FOLLOW_UP,
        SEND_NOTIFICATION,
        CHANGE_STATUS,
        ARCHIVE,
        SEND_WEBHOOK,
        UPDATE_ENTITY_STATUS,
        ASSIGN_ACTIVITY,
    ];

    /// Maps `CreateTask`, `create-task` and `create_task` to the same name.
    pub fn canonical(action_type: &str) -> Option<&'static str> {
        let folded: String = action_type
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        ALL.into_iter().find(|name| name.replace('_', "") == folded)
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("invalid action config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Entity a due execution acts on, with the rule that scheduled it.
#[derive(Debug, Clone, Serialize)]
pub struct ActionTarget {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub snapshot: Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn execute(
        &self,
        ctx: &TenantContext,
        action_type: &str,
        action_config: &Value,
        target: &ActionTarget,
    ) -> Result<Value, ActionError>;
}

static TEMPLATE_VAR: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}"));

fn render_string(template: &str, snapshot: &Value) -> String {
    let Ok(re) = TEMPLATE_VAR.as_ref() else {
        return template.to_string();
    };

    re.replace_all(template, |caps: &regex::Captures| match field_value(snapshot, &caps[1]) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => caps[0].to_string(),
        Some(other) => other.to_string(),
    })
    .into_owned()
}

/// Substitutes `{{field}}` placeholders in every string of `config` from the
/// target snapshot. Unknown fields are left as written.
pub fn render_templates(config: &Value, snapshot: &Value) -> Value {
    match config {
        Value::String(s) => Value::String(render_string(s, snapshot)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_templates(v, snapshot)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_templates(v, snapshot)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// First non-blank string under any of `keys`.
fn config_str<'a>(config: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| config.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn config_i64(config: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().filter_map(|key| config.get(*key)).find_map(|value| match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

pub const MAX_FOLLOW_UP_DAYS: i64 = 3650;

/// `days_after` of a follow-up config, defaulting to one day.
pub fn follow_up_days(config: &Value) -> Result<i64, ActionError> {
    let days = config_i64(config, &["days_after", "daysAfter"]).unwrap_or(1);
    if !(0..=MAX_FOLLOW_UP_DAYS).contains(&days) {
        return Err(ActionError::InvalidConfig(format!(
            "days_after must be between 0 and {}",
            MAX_FOLLOW_UP_DAYS
        )));
    }
    Ok(days)
}

/// User id an `assign_activity` config hands the activity to.
pub fn assignee(config: &Value) -> Result<Uuid, ActionError> {
    let raw = config_str(config, &["assign_to_user_id", "assignToUserId", "user_id"])
        .ok_or_else(|| ActionError::InvalidConfig("missing 'assign_to_user_id'".to_string()))?;
    Uuid::parse_str(raw).map_err(|_| ActionError::InvalidConfig(format!("'{}' is not a user id", raw)))
}

fn snapshot_uuid(snapshot: &Value, field: &str) -> Option<Uuid> {
    field_value(snapshot, field)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Dispatcher for the built-in CRM actions.
pub struct CrmActionDispatcher {
    store: SharedStore,
    notifier: Arc<dyn ChangeNotifier>,
    http: reqwest::Client,
}

impl CrmActionDispatcher {
    pub fn new(store: SharedStore, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self::with_http_client(store, notifier, reqwest::Client::new())
    }

    pub fn with_http_client(store: SharedStore, notifier: Arc<dyn ChangeNotifier>, http: reqwest::Client) -> Self {
        Self { store, notifier, http }
    }

    fn require_lead(action: &str, target: &ActionTarget) -> Result<(), ActionError> {
        if target.entity_type != entity_types::LEAD {
            return Err(ActionError::InvalidConfig(format!(
                "{} only applies to {} entities, not {}",
                action,
                entity_types::LEAD,
                target.entity_type
            )));
        }
        Ok(())
    }

    /// Current owner of the target: live lead owner for leads, otherwise the snapshot's `assigned_to`.
    async fn owner_of(&self, ctx: &TenantContext, target: &ActionTarget) -> Result<Option<Uuid>, ActionError> {
        if target.entity_type == entity_types::LEAD {
            let lead = self.store.get_lead(ctx, target.entity_id).await?;
            return Ok(lead.and_then(|l| l.assigned_to));
        }
        Ok(snapshot_uuid(&target.snapshot, "assigned_to"))
    }

    async fn create_activity(
        &self,
        ctx: &TenantContext,
        target: &ActionTarget,
        activity: Activity,
    ) -> Result<Value, ActionError> {
        let link = EntityRef::new(&target.entity_type, target.entity_id);
        self.store.insert_activity(ctx, &activity, &[link]).await?;

        info!(
            activity_id = %activity.id,
            activity_type = %activity.activity_type,
            entity_id = %target.entity_id,
            rule_id = %target.rule_id,
            "Workflow activity created"
        );

        Ok(serde_json::json!({
            "activity_id": activity.id,
            "activity_type": activity.activity_type,
            "assigned_to": activity.assigned_to,
        }))
    }

    async fn create_task(&self, ctx: &TenantContext, config: &Value, target: &ActionTarget) -> Result<Value, ActionError> {
        let now = Utc::now();
        let activity = Activity {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            activity_type: config_str(config, &["activity_type", "activityType"])
                .unwrap_or("Task")
                .to_string(),
            subject: config_str(config, &["subject"])
                .map(str::to_string)
                .unwrap_or_else(|| format!("Workflow task: {}", target.rule_name)),
            description: Some(
                config_str(config, &["description"])
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Created by workflow rule: {}", target.rule_name)),
            ),
            status: "Pending".to_string(),
            priority: config_str(config, &["priority"]).map(str::to_string),
            assigned_to: self.owner_of(ctx, target).await?,
            scheduled_on: Some(now),
            due_date: None,
            created_by: ctx.actor_id,
            created_at: now,
        };
        self.create_activity(ctx, target, activity).await
    }

    async fn create_follow_up(
        &self,
        ctx: &TenantContext,
        config: &Value,
        target: &ActionTarget,
    ) -> Result<Value, ActionError> {
        let days_after = follow_up_days(config)?;

        let now = Utc::now();
        let due = Duration::try_days(days_after)
            .and_then(|offset| now.checked_add_signed(offset))
            .ok_or_else(|| ActionError::InvalidConfig(format!("days_after {} is out of range", days_after)))?;
        let activity = Activity {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            activity_type: "FollowUp".to_string(),
            subject: config_str(config, &["subject"]).unwrap_or("Follow-up").to_string(),
            description: Some(
                config_str(config, &["description"])
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Follow-up from workflow rule: {}", target.rule_name)),
            ),
            status: "Pending".to_string(),
            priority: Some(config_str(config, &["priority"]).unwrap_or("Medium").to_string()),
            assigned_to: self.owner_of(ctx, target).await?,
            scheduled_on: Some(due),
            due_date: Some(due),
            created_by: ctx.actor_id,
            created_at: now,
        };
        self.create_activity(ctx, target, activity).await
    }

    async fn send_notification(
        &self,
        ctx: &TenantContext,
        config: &Value,
        target: &ActionTarget,
    ) -> Result<Value, ActionError> {
        let title = config_str(config, &["title"])
            .map(str::to_string)
            .unwrap_or_else(|| format!("Workflow notification: {}", target.rule_name));
        let message = config_str(config, &["message"])
            .map(str::to_string)
            .unwrap_or_else(|| format!("Workflow rule '{}' triggered for {}", target.rule_name, target.entity_id));

        let payload = serde_json::json!({
            "title": title,
            "message": message,
            "rule_id": target.rule_id,
        });

        self.notifier
            .notify(
                ChangeEvent::new(ctx.tenant_id, &target.entity_type, "workflow_notification", target.entity_id)
                    .with_payload(payload.clone()),
            )
            .await
            .map_err(|e| ActionError::Failed(format!("notification not delivered: {}", e)))?;

        Ok(payload)
    }

    async fn change_status(&self, ctx: &TenantContext, config: &Value, target: &ActionTarget) -> Result<Value, ActionError> {
        Self::require_lead(action_types::CHANGE_STATUS, target)?;

        let raw = config_str(config, &["status"])
            .ok_or_else(|| ActionError::InvalidConfig("missing 'status'".to_string()))?;
        let status =
            LeadStatus::parse(raw).ok_or_else(|| ActionError::InvalidConfig(format!("unknown lead status '{}'", raw)))?;

        self.store.set_status(ctx, target.entity_id, status).await?;

        notify_quietly(
            self.notifier.as_ref(),
            ChangeEvent::new(ctx.tenant_id, entity_types::LEAD, "status_changed", target.entity_id)
                .with_payload(serde_json::json!({ "status": status.as_str() })),
        )
        .await;

        Ok(serde_json::json!({ "status": status.as_str() }))
    }

    async fn archive(&self, ctx: &TenantContext, target: &ActionTarget) -> Result<Value, ActionError> {
        Self::require_lead(action_types::ARCHIVE, target)?;

        self.store.archive_lead(ctx, target.entity_id).await?;

        notify_quietly(
            self.notifier.as_ref(),
            ChangeEvent::new(ctx.tenant_id, entity_types::LEAD, "archived", target.entity_id),
        )
        .await;

        Ok(serde_json::json!({ "archived": true }))
    }

    /// Status change for leads and opportunities.
    async fn update_entity_status(
        &self,
        ctx: &TenantContext,
        config: &Value,
        target: &ActionTarget,
    ) -> Result<Value, ActionError> {
        let raw = config_str(config, &["status"])
            .ok_or_else(|| ActionError::InvalidConfig("missing 'status'".to_string()))?;

        let status = match target.entity_type.as_str() {
            entity_types::LEAD => {
                let status = LeadStatus::parse(raw)
                    .ok_or_else(|| ActionError::InvalidConfig(format!("unknown lead status '{}'", raw)))?;
                self.store.set_status(ctx, target.entity_id, status).await?;
                status.as_str()
            }
            entity_types::OPPORTUNITY => {
                let status = OpportunityStatus::parse(raw)
                    .ok_or_else(|| ActionError::InvalidConfig(format!("unknown opportunity status '{}'", raw)))?;
                self.store.set_opportunity_status(ctx, target.entity_id, status).await?;
                status.as_str()
            }
            other => {
                return Err(ActionError::InvalidConfig(format!(
                    "{} does not support {} entities",
                    action_types::UPDATE_ENTITY_STATUS,
                    other
                )));
            }
        };

        info!(
            entity_type = %target.entity_type,
            entity_id = %target.entity_id,
            status,
            rule_id = %target.rule_id,
            "Workflow updated entity status"
        );
        notify_quietly(
            self.notifier.as_ref(),
            ChangeEvent::new(ctx.tenant_id, &target.entity_type, "status_changed", target.entity_id)
                .with_payload(serde_json::json!({ "status": status })),
        )
        .await;

        Ok(serde_json::json!({ "entity_type": target.entity_type, "status": status }))
    }

    async fn assign_activity(
        &self,
        ctx: &TenantContext,
        config: &Value,
        target: &ActionTarget,
    ) -> Result<Value, ActionError> {
        if target.entity_type != entity_types::ACTIVITY {
            return Err(ActionError::InvalidConfig(format!(
                "{} only applies to {} entities, not {}",
                action_types::ASSIGN_ACTIVITY,
                entity_types::ACTIVITY,
                target.entity_type
            )));
        }
        let user_id = assignee(config)?;

        self.store.set_activity_owner(ctx, target.entity_id, user_id).await?;

        notify_quietly(
            self.notifier.as_ref(),
            ChangeEvent::new(ctx.tenant_id, entity_types::ACTIVITY, "assigned", target.entity_id)
                .with_payload(serde_json::json!({ "assigned_to": user_id })),
        )
        .await;

        Ok(serde_json::json!({ "activity_id": target.entity_id, "assigned_to": user_id }))
    }

    async fn send_webhook(&self, config: &Value, target: &ActionTarget) -> Result<Value, ActionError> {
        let url = config_str(config, &["url"]).ok_or_else(|| ActionError::InvalidConfig("missing 'url'".to_string()))?;
        let method = config_str(config, &["method"]).unwrap_or("POST").to_uppercase();
        let payload = match config.get("payload") {
            Some(payload) if !payload.is_null() => payload.clone(),
            _ => serde_json::json!({
                "rule_id": target.rule_id,
                "entity_type": target.entity_type,
                "entity_id": target.entity_id,
                "entity": target.snapshot,
            }),
        };

        let mut request = match method.as_str() {
            "GET" => self.http.get(url),
            "POST" => self.http.post(url).json(&payload),
            "PUT" => self.http.put(url).json(&payload),
            "PATCH" => self.http.patch(url).json(&payload),
            other => return Err(ActionError::InvalidConfig(format!("unsupported HTTP method '{}'", other))),
        };

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ActionError::Failed(format!("webhook {} returned {}", url, status.as_u16())));
        }

        Ok(serde_json::json!({
            "url": url,
            "status_code": status.as_u16(),
        }))
    }
}

#[async_trait]
impl ActionDispatcher for CrmActionDispatcher {
    async fn execute(
        &self,
        ctx: &TenantContext,
        action_type: &str,
        action_config: &Value,
        target: &ActionTarget,
    ) -> Result<Value, ActionError> {
        let action = action_types::canonical(action_type)
            .ok_or_else(|| ActionError::UnknownAction(action_type.to_string()))?;
        let config = render_templates(action_config, &target.snapshot);

        match action {
            action_types::CREATE_TASK => self.create_task(ctx, &config, target).await,
            action_types::CREATE_FOLLOW_UP => self.create_follow_up(ctx, &config, target).await,
            action_types::SEND_NOTIFICATION => self.send_notification(ctx, &config, target).await,
            action_types::CHANGE_STATUS => self.change_status(ctx, &config, target).await,
            action_types::ARCHIVE => self.archive(ctx, target).await,
            action_types::SEND_WEBHOOK => self.send_webhook(&config, target).await,
            action_types::UPDATE_ENTITY_STATUS => self.update_entity_status(ctx, &config, target).await,
            action_types::ASSIGN_ACTIVITY => self.assign_activity(ctx, &config, target).await,
            other => Err(ActionError::UnknownAction(other.to_string())),
        }
    }
}
