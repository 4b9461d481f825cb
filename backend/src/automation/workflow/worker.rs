//! Dispatch path.
//!
//! Each tick reads due pending executions across tenants, claims each one with
//! an atomic Pending -> Running transition and runs the action under a timeout.
//! Whoever loses a claim skips the execution; only the winner writes the outcome.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use leadflow_shared::{ExecutionStatus, WorkflowExecution};

use super::dispatcher::{ActionDispatcher, ActionTarget};
use super::engine::EXECUTION_ENTITY;
use crate::automation::EngineResult;
use crate::automation::notifier::{ChangeEvent, ChangeNotifier, notify_quietly};
use crate::config::WorkflowConfig;
use crate::store::{ExecutionOutcome, SharedStore};
use crate::tenant::TenantContext;

pub const RULE_INACTIVE_ERROR: &str = "rule inactive or deleted";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub due: usize,
    pub completed: usize,
    pub failed: usize,
    /// Claimed by another worker first
    pub skipped: usize,
    /// Storage errors while claiming or recording
    pub errored: usize,
}

enum Processed {
    Finished(ExecutionStatus),
    Skipped,
}

/// A claimed execution always gets an outcome, even when loading its rule failed.
fn settle(execution: &WorkflowExecution, result: EngineResult<ExecutionOutcome>) -> ExecutionOutcome {
    result.unwrap_or_else(|e| {
        error!(execution_id = %execution.id, error = %e, "Workflow action could not be prepared");
        ExecutionOutcome::failed(e.to_string())
    })
}

pub struct WorkflowWorker {
    store: SharedStore,
    dispatcher: Arc<dyn ActionDispatcher>,
    notifier: Arc<dyn ChangeNotifier>,
    config: WorkflowConfig,
}

impl WorkflowWorker {
    pub fn new(
        store: SharedStore,
        dispatcher: Arc<dyn ActionDispatcher>,
        notifier: Arc<dyn ChangeNotifier>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            notifier,
            config,
        }
    }

    /// One poll: claims and runs up to `batch_size` due executions, at most
    /// `max_concurrency` at a time.
    pub async fn run_once(&self, now: DateTime<Utc>) -> EngineResult<DispatchSummary> {
        let due = self.store.due_executions(now, self.config.batch_size.max(1)).await?;
        let mut summary = DispatchSummary {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }

        let results: Vec<_> = stream::iter(due)
            .map(|execution| async move {
                let execution_id = execution.id;
                (execution_id, self.process(execution, now).await)
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for (execution_id, result) in results {
            match result {
                Ok(Processed::Finished(ExecutionStatus::Completed)) => summary.completed += 1,
                Ok(Processed::Finished(_)) => summary.failed += 1,
                Ok(Processed::Skipped) => summary.skipped += 1,
                Err(e) => {
                    error!(execution_id = %execution_id, error = %e, "Workflow execution could not be processed");
                    summary.errored += 1;
                }
            }
        }

        info!(
            due = summary.due,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            errored = summary.errored,
            "Workflow dispatch tick"
        );
        Ok(summary)
    }

    async fn process(&self, execution: WorkflowExecution, now: DateTime<Utc>) -> EngineResult<Processed> {
        if !self.store.claim_execution(execution.id, now).await? {
            debug!(execution_id = %execution.id, "Execution already claimed");
            return Ok(Processed::Skipped);
        }

        let ctx = TenantContext::system(execution.tenant_id);
        let outcome = settle(&execution, self.run_action(&ctx, &execution).await);

        if !self.store.finish_execution(execution.id, &outcome, Utc::now()).await? {
            // the stale sweep got there first
            warn!(execution_id = %execution.id, "Execution was no longer running when its outcome was recorded");
            return Ok(Processed::Skipped);
        }

        match &outcome.error {
            Some(reason) => warn!(
                execution_id = %execution.id,
                rule_id = %execution.rule_id,
                error = %reason,
                "Workflow execution failed"
            ),
            None => debug!(execution_id = %execution.id, rule_id = %execution.rule_id, "Workflow execution completed"),
        }

        let action = if outcome.status == ExecutionStatus::Completed { "completed" } else { "failed" };
        notify_quietly(
            self.notifier.as_ref(),
            ChangeEvent::new(execution.tenant_id, EXECUTION_ENTITY, action, execution.id)
                .with_payload(serde_json::json!({ "rule_id": execution.rule_id, "entity_id": execution.entity_id })),
        )
        .await;

        Ok(Processed::Finished(outcome.status))
    }

    async fn run_action(&self, ctx: &TenantContext, execution: &WorkflowExecution) -> EngineResult<ExecutionOutcome> {
        let rule = match self.store.get_workflow_rule(ctx, execution.rule_id).await? {
            Some(rule) if rule.is_active && !rule.is_deleted => rule,
            _ => return Ok(ExecutionOutcome::failed(RULE_INACTIVE_ERROR)),
        };

        let target = ActionTarget {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            entity_type: execution.entity_type.clone(),
            entity_id: execution.entity_id,
            snapshot: execution.snapshot.clone(),
        };

        let timeout = self.config.action_timeout();
        let result = tokio::time::timeout(
            timeout,
            self.dispatcher
                .execute(ctx, &rule.action_type, &rule.action_config, &target),
        )
        .await;

        Ok(match result {
            Ok(Ok(value)) => ExecutionOutcome::completed(value),
            Ok(Err(e)) => ExecutionOutcome::failed(e.to_string()),
            Err(_) => ExecutionOutcome::failed(format!("action timed out after {}s", timeout.as_secs())),
        })
    }

    /// Fails executions left Running longer than the staleness threshold.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let cutoff = now - Duration::seconds(self.config.stale_after_secs.max(0));
        let swept = self.store.fail_stale_executions(cutoff, now).await?;
        if swept > 0 {
            warn!(swept, cutoff = %cutoff, "Failed stale workflow executions");
        }
        Ok(swept)
    }
}
