use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use leadflow_shared::{ExecutionStatus, WorkflowExecution, WorkflowRule};

use crate::automation::conditions::ConditionSet;
use crate::automation::notifier::{ChangeEvent, ChangeNotifier, notify_quietly};
use crate::automation::{EngineError, EngineResult};
use crate::store::SharedStore;
use crate::tenant::TenantContext;

pub const EXECUTION_ENTITY: &str = "WorkflowExecution";

/// Trigger path: turns a domain event into pending executions.
pub struct WorkflowEngine {
    store: SharedStore,
    notifier: Arc<dyn ChangeNotifier>,
}

impl WorkflowEngine {
    pub fn new(store: SharedStore, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self { store, notifier }
    }

    fn rule_matches(rule: &WorkflowRule, snapshot: &Value) -> bool {
        let condition = match &rule.condition {
            None | Some(Value::Null) => return true,
            Some(Value::Object(map)) if map.is_empty() => return true,
            Some(condition) => condition,
        };

        match ConditionSet::from_value(condition) {
            Ok(conditions) => conditions.evaluate(snapshot),
            Err(e) => {
                warn!(rule_id = %rule.id, rule = %rule.name, error = %e, "Skipping workflow rule");
                false
            }
        }
    }

    pub async fn on_event(
        &self,
        ctx: &TenantContext,
        entity_type: &str,
        trigger_event: &str,
        entity_id: Uuid,
        snapshot: &Value,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        self.on_event_at(ctx, entity_type, trigger_event, entity_id, snapshot, Utc::now())
            .await
    }

    /// Creates one pending execution per matching rule, scheduled `delay_minutes` after `now`.
    pub async fn on_event_at(
        &self,
        ctx: &TenantContext,
        entity_type: &str,
        trigger_event: &str,
        entity_id: Uuid,
        snapshot: &Value,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        let mut rules = self
            .store
            .list_active_workflow_rules(ctx, entity_type, trigger_event)
            .await?;
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut scheduled = Vec::new();
        for rule in rules.iter().filter(|r| Self::rule_matches(r, snapshot)) {
            let execution = WorkflowExecution {
                id: Uuid::new_v4(),
                tenant_id: ctx.tenant_id,
                rule_id: rule.id,
                entity_type: entity_type.to_string(),
                entity_id,
                snapshot: snapshot.clone(),
                status: ExecutionStatus::Pending,
                scheduled_for: now + Duration::minutes(i64::from(rule.delay_minutes.max(0))),
                claimed_at: None,
                executed_on: None,
                result: None,
                error: None,
                created_at: now,
            };
            self.store.insert_execution(ctx, &execution).await?;

            debug!(
                execution_id = %execution.id,
                rule_id = %rule.id,
                scheduled_for = %execution.scheduled_for,
                "Workflow execution scheduled"
            );
            scheduled.push(execution);
        }

        if !scheduled.is_empty() {
            info!(
                entity_type = %entity_type,
                trigger_event = %trigger_event,
                entity_id = %entity_id,
                scheduled = scheduled.len(),
                "Workflow rules triggered"
            );
        }

        Ok(scheduled)
    }

    /// Re-runs a failed execution as a new pending record; the failed one stays as it was.
    pub async fn retry_execution(&self, ctx: &TenantContext, execution_id: Uuid) -> EngineResult<WorkflowExecution> {
        let failed = self
            .store
            .get_execution(ctx, execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Workflow execution {}", execution_id)))?;

        if failed.status != ExecutionStatus::Failed {
            return Err(EngineError::DataIntegrity(format!(
                "only failed executions can be retried; {} is {:?}",
                execution_id, failed.status
            )));
        }

        let now = Utc::now();
        let retry = WorkflowExecution {
            id: Uuid::new_v4(),
            status: ExecutionStatus::Pending,
            scheduled_for: now,
            claimed_at: None,
            executed_on: None,
            result: None,
            error: None,
            created_at: now,
            ..failed
        };
        self.store.insert_execution(ctx, &retry).await?;

        info!(execution_id = %retry.id, retry_of = %execution_id, actor = ?ctx.actor_id, "Workflow execution re-triggered");

        notify_quietly(
            self.notifier.as_ref(),
            ChangeEvent::new(ctx.tenant_id, EXECUTION_ENTITY, "retried", retry.id)
                .with_payload(serde_json::json!({ "retry_of": execution_id })),
        )
        .await;

        Ok(retry)
    }

    pub async fn list_executions(
        &self,
        ctx: &TenantContext,
        status: Option<ExecutionStatus>,
        limit: i64,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        Ok(self.store.list_executions(ctx, status, limit.clamp(1, 500)).await?)
    }
}
