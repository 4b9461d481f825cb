//! Entry points called by CRUD use cases.
//!
//! Engine failures here are logged and reported in the outcome, never returned
//! as errors: a failed scoring pass must not fail the lead write that caused it.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use leadflow_shared::{Lead, entity_types};

use super::assignment::{AssignmentEngine, AssignmentOutcome};
use super::duplicates::DuplicateDetector;
use super::scoring::ScoringEngine;
use super::workflow::WorkflowEngine;
use super::{EngineError, EngineResult};
use crate::config::ScoringConfig;
use crate::store::SharedStore;
use crate::tenant::TenantContext;

pub mod trigger_events {
    pub const CREATED: &str = "created";
    pub const UPDATED: &str = "updated";
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LeadAutomationOutcome {
    pub lead_id: Uuid,
    pub score: Option<i32>,
    pub assignment: Option<AssignmentOutcome>,
    pub duplicates_found: usize,
    pub executions_scheduled: usize,
    /// One line per engine that failed
    pub errors: Vec<String>,
}

impl LeadAutomationOutcome {
    fn new(lead_id: Uuid) -> Self {
        Self {
            lead_id,
            ..Default::default()
        }
    }

    fn record<T>(&mut self, engine: &str, result: EngineResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!(lead_id = %self.lead_id, engine, error = %e, "Lead automation step failed");
                self.errors.push(format!("{}: {}", engine, e));
                None
            }
        }
    }
}

pub struct AutomationPipeline {
    store: SharedStore,
    pub scoring: Arc<ScoringEngine>,
    pub assignment: Arc<AssignmentEngine>,
    pub duplicates: Arc<DuplicateDetector>,
    pub workflow: Arc<WorkflowEngine>,
    config: ScoringConfig,
}

impl AutomationPipeline {
    pub fn new(
        store: SharedStore,
        scoring: Arc<ScoringEngine>,
        assignment: Arc<AssignmentEngine>,
        duplicates: Arc<DuplicateDetector>,
        workflow: Arc<WorkflowEngine>,
        config: ScoringConfig,
    ) -> Self {
        Self {
            store,
            scoring,
            assignment,
            duplicates,
            workflow,
            config,
        }
    }

    /// Reads the lead back from storage so every engine sees the committed write.
    async fn load(&self, ctx: &TenantContext, lead_id: Uuid) -> EngineResult<Lead> {
        self.store
            .get_lead(ctx, lead_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Lead {}", lead_id)))
    }

    /// Full scoring pass, auto-assignment when the lead has no owner, duplicate
    /// scan and `created` workflow rules. Only a missing lead is an error.
    pub async fn on_lead_created(&self, ctx: &TenantContext, lead_id: Uuid) -> EngineResult<LeadAutomationOutcome> {
        let lead = self.load(ctx, lead_id).await?;
        let mut outcome = LeadAutomationOutcome::new(lead_id);

        outcome.score = outcome.record("scoring", self.scoring.apply_rules_on_event(ctx, &lead, None).await);

        if lead.assigned_to.is_none() {
            let assigned = self.assignment.assign(ctx, &lead).await;
            outcome.assignment = outcome.record("assignment", assigned).flatten();
        }

        if let Some(found) = outcome.record("duplicates", self.duplicates.find_duplicates(ctx, &lead).await) {
            outcome.duplicates_found = found.len();
        }

        // snapshot after scoring and assignment so rules can see both
        let current = self.load(ctx, lead_id).await.unwrap_or(lead);
        self.trigger_workflow(ctx, &current, trigger_events::CREATED, &mut outcome).await;

        info!(
            lead_id = %lead_id,
            score = ?outcome.score,
            assigned = outcome.assignment.is_some(),
            duplicates = outcome.duplicates_found,
            executions = outcome.executions_scheduled,
            "Lead created automation complete"
        );
        Ok(outcome)
    }

    /// Scores the configured update category, re-runs duplicate detection and
    /// fires `updated` workflow rules. Ownership is left alone.
    pub async fn on_lead_updated(&self, ctx: &TenantContext, lead_id: Uuid) -> EngineResult<LeadAutomationOutcome> {
        let lead = self.load(ctx, lead_id).await?;
        let mut outcome = LeadAutomationOutcome::new(lead_id);

        let category = self.config.update_category.as_deref();
        outcome.score = outcome.record("scoring", self.scoring.apply_rules_on_event(ctx, &lead, category).await);

        if let Some(found) = outcome.record("duplicates", self.duplicates.find_duplicates(ctx, &lead).await) {
            outcome.duplicates_found = found.len();
        }

        let current = self.load(ctx, lead_id).await.unwrap_or(lead);
        self.trigger_workflow(ctx, &current, trigger_events::UPDATED, &mut outcome).await;

        info!(
            lead_id = %lead_id,
            score = ?outcome.score,
            duplicates = outcome.duplicates_found,
            executions = outcome.executions_scheduled,
            "Lead updated automation complete"
        );
        Ok(outcome)
    }

    async fn trigger_workflow(&self, ctx: &TenantContext, lead: &Lead, event: &str, outcome: &mut LeadAutomationOutcome) {
        let scheduled = self
            .workflow
            .on_event(ctx, entity_types::LEAD, event, lead.id, &lead.to_snapshot())
            .await;
        if let Some(executions) = outcome.record("workflow", scheduled) {
            outcome.executions_scheduled = executions.len();
        }
    }

    /// Workflow triggering for any entity type. Returns how many executions were scheduled.
    pub async fn on_domain_event(
        &self,
        ctx: &TenantContext,
        entity_type: &str,
        event_name: &str,
        entity_id: Uuid,
        snapshot: &Value,
    ) -> usize {
        match self
            .workflow
            .on_event(ctx, entity_type, event_name, entity_id, snapshot)
            .await
        {
            Ok(executions) => executions.len(),
            Err(e) => {
                error!(
                    entity_type = %entity_type,
                    event = %event_name,
                    entity_id = %entity_id,
                    error = %e,
                    "Workflow trigger failed"
                );
                0
            }
        }
    }
}
