use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use leadflow_shared::{
    Activity, ActivityLink, AssignmentMember, AssignmentRule, DuplicateStatus, EntityRef, ExecutionStatus, Lead,
    LeadCommunication, LeadDuplicate, LeadStatus, MergeHistoryEntry, Opportunity, OpportunityStatus,
    ScoreHistoryEntry, ScoringRule, WorkflowExecution, WorkflowRule, entity_types, ordered_pair,
};

use super::{
    ActivityStore, AssignmentStore, DuplicateStore, ExecutionOutcome, LeadStore, MergePlan, MergeStore,
    ScoringStore, StoreError, StoreResult, WorkflowStore, normalize_company, normalize_email, normalize_phone,
};
use crate::tenant::TenantContext;

#[derive(Default)]
struct Tables {
    leads: HashMap<Uuid, Lead>,
    scoring_rules: HashMap<Uuid, ScoringRule>,
    score_history: Vec<ScoreHistoryEntry>,
    assignment_rules: HashMap<Uuid, AssignmentRule>,
    members: HashMap<Uuid, AssignmentMember>,
    duplicates: HashMap<Uuid, LeadDuplicate>,
    merge_history: Vec<MergeHistoryEntry>,
    workflow_rules: HashMap<Uuid, WorkflowRule>,
    executions: HashMap<Uuid, WorkflowExecution>,
    activities: HashMap<Uuid, Activity>,
    activity_links: Vec<ActivityLink>,
    opportunities: HashMap<Uuid, Opportunity>,
    communications: Vec<LeadCommunication>,
}

impl Tables {
    fn live_lead_mut(&mut self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<&mut Lead> {
        self.leads
            .get_mut(&lead_id)
            .filter(|l| l.tenant_id == ctx.tenant_id && !l.is_deleted)
            .ok_or_else(|| StoreError::NotFound(format!("Lead {}", lead_id)))
    }
}

/// In-process store behind a single lock.
///
/// Each trait method takes the lock once, so multi-step writes such as
/// `apply_merge` are atomic with respect to every other caller.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn member_order(a: &AssignmentMember, b: &AssignmentMember) -> std::cmp::Ordering {
    a.position
        .cmp(&b.position)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn get_lead(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Option<Lead>> {
        let tables = self.tables.read().await;
        Ok(tables
            .leads
            .get(&lead_id)
            .filter(|l| l.tenant_id == ctx.tenant_id && !l.is_deleted)
            .cloned())
    }

    async fn insert_lead(&self, ctx: &TenantContext, lead: &Lead) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.leads.contains_key(&lead.id) {
            return Err(StoreError::Conflict(format!("Lead {} already exists", lead.id)));
        }
        let mut lead = lead.clone();
        lead.tenant_id = ctx.tenant_id;
        tables.leads.insert(lead.id, lead);
        Ok(())
    }

    async fn set_score(&self, ctx: &TenantContext, lead_id: Uuid, score: i32) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let lead = tables.live_lead_mut(ctx, lead_id)?;
        lead.score = score;
        lead.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn set_owner(&self, ctx: &TenantContext, lead_id: Uuid, owner: Option<Uuid>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let lead = tables.live_lead_mut(ctx, lead_id)?;
        lead.assigned_to = owner;
        lead.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn set_status(&self, ctx: &TenantContext, lead_id: Uuid, status: LeadStatus) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let lead = tables.live_lead_mut(ctx, lead_id)?;
        lead.status = status;
        lead.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn archive_lead(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let lead = tables.live_lead_mut(ctx, lead_id)?;
        lead.is_active = false;
        lead.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn find_duplicate_candidates(&self, ctx: &TenantContext, lead: &Lead) -> StoreResult<Vec<Lead>> {
        let email = normalize_email(lead.email.as_deref());
        let phone = normalize_phone(lead.phone.as_deref());
        let company = normalize_company(lead.company_name.as_deref());

        let tables = self.tables.read().await;
        let mut candidates: Vec<Lead> = tables
            .leads
            .values()
            .filter(|other| other.tenant_id == ctx.tenant_id && !other.is_deleted && other.id != lead.id)
            .filter(|other| {
                let same_email = email.is_some() && normalize_email(other.email.as_deref()) == email;
                let same_phone = phone.is_some() && normalize_phone(other.phone.as_deref()) == phone;
                let same_company = company.is_some() && normalize_company(other.company_name.as_deref()) == company;
                same_email || same_phone || same_company
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(candidates)
    }

    async fn list_scorable_leads(&self, ctx: &TenantContext) -> StoreResult<Vec<Uuid>> {
        let tables = self.tables.read().await;
        Ok(tables
            .leads
            .values()
            .filter(|l| l.tenant_id == ctx.tenant_id && l.is_active && !l.is_deleted && !l.status.is_terminal())
            .map(|l| l.id)
            .collect())
    }

    async fn count_open_leads(&self, ctx: &TenantContext, owners: &[Uuid]) -> StoreResult<HashMap<Uuid, i64>> {
        let tables = self.tables.read().await;
        let mut counts = HashMap::new();
        for lead in tables.leads.values() {
            if lead.tenant_id != ctx.tenant_id || lead.is_deleted || lead.status.is_terminal() {
                continue;
            }
            if let Some(owner) = lead.assigned_to.filter(|o| owners.contains(o)) {
                *counts.entry(owner).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn list_tenants(&self) -> StoreResult<Vec<Uuid>> {
        let tables = self.tables.read().await;
        let mut tenants: Vec<Uuid> = tables.leads.values().map(|l| l.tenant_id).collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }
}

#[async_trait]
impl ScoringStore for MemoryStore {
    async fn list_active_scoring_rules(
        &self,
        ctx: &TenantContext,
        category: Option<&str>,
    ) -> StoreResult<Vec<ScoringRule>> {
        let tables = self.tables.read().await;
        Ok(tables
            .scoring_rules
            .values()
            .filter(|r| r.tenant_id == ctx.tenant_id && r.is_active)
            .filter(|r| category.is_none_or(|c| r.category.eq_ignore_ascii_case(c)))
            .cloned()
            .collect())
    }

    async fn list_scoring_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<ScoringRule>> {
        let tables = self.tables.read().await;
        let mut rules: Vec<ScoringRule> = tables
            .scoring_rules
            .values()
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rules)
    }

    async fn get_scoring_rule(&self, ctx: &TenantContext, rule_id: Uuid) -> StoreResult<Option<ScoringRule>> {
        let tables = self.tables.read().await;
        Ok(tables
            .scoring_rules
            .get(&rule_id)
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .cloned())
    }

    async fn insert_scoring_rule(&self, ctx: &TenantContext, rule: &ScoringRule) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let mut rule = rule.clone();
        rule.tenant_id = ctx.tenant_id;
        tables.scoring_rules.insert(rule.id, rule);
        Ok(())
    }

    async fn update_scoring_rule(&self, ctx: &TenantContext, rule: &ScoringRule) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .scoring_rules
            .get_mut(&rule.id)
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("Scoring rule {}", rule.id)))?;
        *existing = ScoringRule {
            tenant_id: ctx.tenant_id,
            updated_at: Some(Utc::now()),
            ..rule.clone()
        };
        Ok(())
    }

    async fn append_score_history(&self, ctx: &TenantContext, entry: &ScoreHistoryEntry) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let mut entry = entry.clone();
        entry.tenant_id = ctx.tenant_id;
        tables.score_history.push(entry);
        Ok(())
    }

    async fn list_score_history(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Vec<ScoreHistoryEntry>> {
        let tables = self.tables.read().await;
        let mut history: Vec<ScoreHistoryEntry> = tables
            .score_history
            .iter()
            .filter(|e| e.tenant_id == ctx.tenant_id && e.lead_id == lead_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(history)
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn list_active_assignment_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<AssignmentRule>> {
        let tables = self.tables.read().await;
        Ok(tables
            .assignment_rules
            .values()
            .filter(|r| r.tenant_id == ctx.tenant_id && r.is_active)
            .cloned()
            .collect())
    }

    async fn list_assignment_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<AssignmentRule>> {
        let tables = self.tables.read().await;
        let mut rules: Vec<AssignmentRule> = tables
            .assignment_rules
            .values()
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn get_assignment_rule(&self, ctx: &TenantContext, rule_id: Uuid) -> StoreResult<Option<AssignmentRule>> {
        let tables = self.tables.read().await;
        Ok(tables
            .assignment_rules
            .get(&rule_id)
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .cloned())
    }

    async fn insert_assignment_rule(&self, ctx: &TenantContext, rule: &AssignmentRule) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let mut rule = rule.clone();
        rule.tenant_id = ctx.tenant_id;
        tables.assignment_rules.insert(rule.id, rule);
        Ok(())
    }

    async fn update_assignment_rule(&self, ctx: &TenantContext, rule: &AssignmentRule) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .assignment_rules
            .get_mut(&rule.id)
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("Assignment rule {}", rule.id)))?;
        existing.name = rule.name.clone();
        existing.assignment_type = rule.assignment_type;
        existing.criteria = rule.criteria.clone();
        existing.skill_attribute = rule.skill_attribute.clone();
        existing.priority = rule.priority;
        existing.is_active = rule.is_active;
        existing.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn list_members(
        &self,
        ctx: &TenantContext,
        rule_id: Uuid,
        active_only: bool,
    ) -> StoreResult<Vec<AssignmentMember>> {
        let tables = self.tables.read().await;
        let mut members: Vec<AssignmentMember> = tables
            .members
            .values()
            .filter(|m| m.tenant_id == ctx.tenant_id && m.rule_id == rule_id)
            .filter(|m| !active_only || m.is_active)
            .cloned()
            .collect();
        members.sort_by(member_order);
        Ok(members)
    }

    async fn insert_member(&self, ctx: &TenantContext, member: &AssignmentMember) -> StoreResult<AssignmentMember> {
        let mut tables = self.tables.write().await;
        let rule_exists = tables
            .assignment_rules
            .get(&member.rule_id)
            .is_some_and(|r| r.tenant_id == ctx.tenant_id);
        if !rule_exists {
            return Err(StoreError::NotFound(format!("Assignment rule {}", member.rule_id)));
        }

        let position = tables
            .members
            .values()
            .filter(|m| m.rule_id == member.rule_id)
            .map(|m| m.position + 1)
            .max()
            .unwrap_or(0);

        let mut member = member.clone();
        member.tenant_id = ctx.tenant_id;
        member.position = position;
        tables.members.insert(member.id, member.clone());
        Ok(member)
    }

    async fn set_member_active(&self, ctx: &TenantContext, member_id: Uuid, active: bool) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let member = tables
            .members
            .get_mut(&member_id)
            .filter(|m| m.tenant_id == ctx.tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("Assignment member {}", member_id)))?;
        member.is_active = active;
        Ok(())
    }

    async fn update_cursor(
        &self,
        ctx: &TenantContext,
        rule_id: Uuid,
        expected_version: i64,
        last_assigned_index: i32,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let rule = tables
            .assignment_rules
            .get_mut(&rule_id)
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("Assignment rule {}", rule_id)))?;

        if rule.version != expected_version {
            return Ok(false);
        }
        rule.last_assigned_index = last_assigned_index;
        rule.version += 1;
        Ok(true)
    }
}

#[async_trait]
impl DuplicateStore for MemoryStore {
    async fn find_duplicate_pair(&self, ctx: &TenantContext, a: Uuid, b: Uuid) -> StoreResult<Option<LeadDuplicate>> {
        let (first, second) = ordered_pair(a, b);
        let tables = self.tables.read().await;
        Ok(tables
            .duplicates
            .values()
            .find(|d| {
                d.tenant_id == ctx.tenant_id
                    && ((d.lead1_id == first && d.lead2_id == second) || (d.lead1_id == second && d.lead2_id == first))
            })
            .cloned())
    }

    async fn insert_duplicate(&self, ctx: &TenantContext, duplicate: &LeadDuplicate) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let (first, second) = ordered_pair(duplicate.lead1_id, duplicate.lead2_id);
        let exists = tables
            .duplicates
            .values()
            .any(|d| d.tenant_id == ctx.tenant_id && d.lead1_id == first && d.lead2_id == second);
        if exists {
            return Ok(false);
        }

        let mut duplicate = duplicate.clone();
        duplicate.tenant_id = ctx.tenant_id;
        duplicate.lead1_id = first;
        duplicate.lead2_id = second;
        tables.duplicates.insert(duplicate.id, duplicate);
        Ok(true)
    }

    async fn get_duplicate(&self, ctx: &TenantContext, duplicate_id: Uuid) -> StoreResult<Option<LeadDuplicate>> {
        let tables = self.tables.read().await;
        Ok(tables
            .duplicates
            .get(&duplicate_id)
            .filter(|d| d.tenant_id == ctx.tenant_id)
            .cloned())
    }

    async fn list_duplicates(
        &self,
        ctx: &TenantContext,
        status: Option<DuplicateStatus>,
    ) -> StoreResult<Vec<LeadDuplicate>> {
        let tables = self.tables.read().await;
        let mut duplicates: Vec<LeadDuplicate> = tables
            .duplicates
            .values()
            .filter(|d| d.tenant_id == ctx.tenant_id && status.is_none_or(|s| d.status == s))
            .cloned()
            .collect();
        duplicates.sort_by(|a, b| b.confidence_score.cmp(&a.confidence_score).then(a.created_at.cmp(&b.created_at)));
        Ok(duplicates)
    }

    async fn resolve_duplicate(
        &self,
        ctx: &TenantContext,
        duplicate_id: Uuid,
        status: DuplicateStatus,
    ) -> StoreResult<Option<LeadDuplicate>> {
        let mut tables = self.tables.write().await;
        let Some(duplicate) = tables
            .duplicates
            .get_mut(&duplicate_id)
            .filter(|d| d.tenant_id == ctx.tenant_id)
        else {
            return Ok(None);
        };

        duplicate.status = status;
        duplicate.resolved_at = Some(Utc::now());
        duplicate.resolved_by = ctx.actor_id;
        Ok(Some(duplicate.clone()))
    }
}

#[async_trait]
impl MergeStore for MemoryStore {
    async fn apply_merge(&self, ctx: &TenantContext, plan: &MergePlan) -> StoreResult<()> {
        let mut tables = self.tables.write().await;

        // Check everything before the first write so a failure leaves no trace.
        tables.live_lead_mut(ctx, plan.survivor.id)?;
        for loser_id in &plan.loser_ids {
            tables.live_lead_mut(ctx, *loser_id)?;
        }

        let now = Utc::now();
        let mut history = plan.history.clone();
        history.tenant_id = ctx.tenant_id;
        tables.merge_history.push(history);

        let mut survivor = plan.survivor.clone();
        survivor.tenant_id = ctx.tenant_id;
        survivor.updated_at = Some(now);
        tables.leads.insert(survivor.id, survivor);

        for link in tables.activity_links.iter_mut() {
            if link.tenant_id == ctx.tenant_id
                && link.entity.entity_type == entity_types::LEAD
                && plan.loser_ids.contains(&link.entity.entity_id)
            {
                link.entity.entity_id = plan.survivor.id;
            }
        }

        for opportunity in tables.opportunities.values_mut() {
            if opportunity.tenant_id == ctx.tenant_id
                && opportunity.status == OpportunityStatus::Open
                && opportunity.lead_id.is_some_and(|id| plan.loser_ids.contains(&id))
            {
                opportunity.lead_id = Some(plan.survivor.id);
                opportunity.updated_at = Some(now);
            }
        }

        for communication in tables.communications.iter_mut() {
            if communication.tenant_id == ctx.tenant_id && plan.loser_ids.contains(&communication.lead_id) {
                communication.lead_id = plan.survivor.id;
            }
        }

        for loser_id in &plan.loser_ids {
            if let Some(loser) = tables.leads.get_mut(loser_id) {
                loser.is_deleted = true;
                loser.is_active = false;
                loser.updated_at = Some(now);
            }
        }

        for duplicate in tables.duplicates.values_mut() {
            if duplicate.tenant_id == ctx.tenant_id
                && duplicate.status == DuplicateStatus::Pending
                && plan.loser_ids.iter().any(|id| duplicate.involves(*id))
            {
                duplicate.status = DuplicateStatus::Confirmed;
                duplicate.resolved_at = Some(now);
                duplicate.resolved_by = ctx.actor_id;
            }
        }

        Ok(())
    }

    async fn list_merge_history(&self, ctx: &TenantContext, survivor_id: Uuid) -> StoreResult<Vec<MergeHistoryEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .merge_history
            .iter()
            .filter(|h| h.tenant_id == ctx.tenant_id && h.survivor_id == survivor_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn list_active_workflow_rules(
        &self,
        ctx: &TenantContext,
        entity_type: &str,
        trigger_event: &str,
    ) -> StoreResult<Vec<WorkflowRule>> {
        let tables = self.tables.read().await;
        let mut rules: Vec<WorkflowRule> = tables
            .workflow_rules
            .values()
            .filter(|r| r.tenant_id == ctx.tenant_id && r.is_active && !r.is_deleted)
            .filter(|r| r.entity_type.eq_ignore_ascii_case(entity_type))
            .filter(|r| r.trigger_event.eq_ignore_ascii_case(trigger_event))
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn list_workflow_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<WorkflowRule>> {
        let tables = self.tables.read().await;
        let mut rules: Vec<WorkflowRule> = tables
            .workflow_rules
            .values()
            .filter(|r| r.tenant_id == ctx.tenant_id && !r.is_deleted)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rules)
    }

    async fn get_workflow_rule(&self, ctx: &TenantContext, rule_id: Uuid) -> StoreResult<Option<WorkflowRule>> {
        let tables = self.tables.read().await;
        Ok(tables
            .workflow_rules
            .get(&rule_id)
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .cloned())
    }

    async fn insert_workflow_rule(&self, ctx: &TenantContext, rule: &WorkflowRule) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let mut rule = rule.clone();
        rule.tenant_id = ctx.tenant_id;
        tables.workflow_rules.insert(rule.id, rule);
        Ok(())
    }

    async fn update_workflow_rule(&self, ctx: &TenantContext, rule: &WorkflowRule) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .workflow_rules
            .get_mut(&rule.id)
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("Workflow rule {}", rule.id)))?;
        *existing = WorkflowRule {
            tenant_id: ctx.tenant_id,
            updated_at: Some(Utc::now()),
            ..rule.clone()
        };
        Ok(())
    }

    async fn insert_execution(&self, ctx: &TenantContext, execution: &WorkflowExecution) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let mut execution = execution.clone();
        execution.tenant_id = ctx.tenant_id;
        tables.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, ctx: &TenantContext, execution_id: Uuid) -> StoreResult<Option<WorkflowExecution>> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions
            .get(&execution_id)
            .filter(|e| e.tenant_id == ctx.tenant_id)
            .cloned())
    }

    async fn list_executions(
        &self,
        ctx: &TenantContext,
        status: Option<ExecutionStatus>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowExecution>> {
        let tables = self.tables.read().await;
        let mut executions: Vec<WorkflowExecution> = tables
            .executions
            .values()
            .filter(|e| e.tenant_id == ctx.tenant_id && status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions.truncate(limit.max(0) as usize);
        Ok(executions)
    }

    async fn due_executions(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<WorkflowExecution>> {
        let tables = self.tables.read().await;
        let mut due: Vec<WorkflowExecution> = tables
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending && e.scheduled_for <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for).then(a.id.cmp(&b.id)));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim_execution(&self, execution_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let execution = tables
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("Workflow execution {}", execution_id)))?;

        if execution.status != ExecutionStatus::Pending {
            return Ok(false);
        }
        execution.status = ExecutionStatus::Running;
        execution.claimed_at = Some(now);
        Ok(true)
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let execution = tables
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("Workflow execution {}", execution_id)))?;

        if !execution.status.can_transition_to(outcome.status) {
            return Ok(false);
        }
        execution.status = outcome.status;
        execution.executed_on = Some(now);
        execution.result = outcome.result.clone();
        execution.error = outcome.error.clone();
        Ok(true)
    }

    async fn fail_stale_executions(&self, claimed_before: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let mut swept = 0;
        for execution in tables.executions.values_mut() {
            let stale = execution.status == ExecutionStatus::Running
                && execution.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                execution.status = ExecutionStatus::Failed;
                execution.executed_on = Some(now);
                execution.error = Some(super::STALE_EXECUTION_ERROR.to_string());
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn insert_activity(&self, ctx: &TenantContext, activity: &Activity, links: &[EntityRef]) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let mut activity = activity.clone();
        activity.tenant_id = ctx.tenant_id;
        for entity in links {
            tables.activity_links.push(ActivityLink {
                id: Uuid::new_v4(),
                tenant_id: ctx.tenant_id,
                activity_id: activity.id,
                entity: entity.clone(),
                created_at: activity.created_at,
            });
        }
        tables.activities.insert(activity.id, activity);
        Ok(())
    }

    async fn list_activity_links(&self, ctx: &TenantContext, entity: &EntityRef) -> StoreResult<Vec<ActivityLink>> {
        let tables = self.tables.read().await;
        Ok(tables
            .activity_links
            .iter()
            .filter(|l| l.tenant_id == ctx.tenant_id && &l.entity == entity)
            .cloned()
            .collect())
    }

    async fn get_activity(&self, ctx: &TenantContext, activity_id: Uuid) -> StoreResult<Option<Activity>> {
        let tables = self.tables.read().await;
        Ok(tables
            .activities
            .get(&activity_id)
            .filter(|a| a.tenant_id == ctx.tenant_id)
            .cloned())
    }

    async fn set_activity_owner(&self, ctx: &TenantContext, activity_id: Uuid, owner: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let activity = tables
            .activities
            .get_mut(&activity_id)
            .filter(|a| a.tenant_id == ctx.tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("Activity {}", activity_id)))?;
        activity.assigned_to = Some(owner);
        Ok(())
    }

    async fn get_opportunity(&self, ctx: &TenantContext, opportunity_id: Uuid) -> StoreResult<Option<Opportunity>> {
        let tables = self.tables.read().await;
        Ok(tables
            .opportunities
            .get(&opportunity_id)
            .filter(|o| o.tenant_id == ctx.tenant_id)
            .cloned())
    }

    async fn set_opportunity_status(
        &self,
        ctx: &TenantContext,
        opportunity_id: Uuid,
        status: OpportunityStatus,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let opportunity = tables
            .opportunities
            .get_mut(&opportunity_id)
            .filter(|o| o.tenant_id == ctx.tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("Opportunity {}", opportunity_id)))?;
        opportunity.status = status;
        opportunity.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn insert_opportunity(&self, ctx: &TenantContext, opportunity: &Opportunity) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let mut opportunity = opportunity.clone();
        opportunity.tenant_id = ctx.tenant_id;
        tables.opportunities.insert(opportunity.id, opportunity);
        Ok(())
    }

    async fn list_opportunities_for_lead(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Vec<Opportunity>> {
        let tables = self.tables.read().await;
        Ok(tables
            .opportunities
            .values()
            .filter(|o| o.tenant_id == ctx.tenant_id && o.lead_id == Some(lead_id))
            .cloned()
            .collect())
    }

    async fn insert_communication(&self, ctx: &TenantContext, communication: &LeadCommunication) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let mut communication = communication.clone();
        communication.tenant_id = ctx.tenant_id;
        tables.communications.push(communication);
        Ok(())
    }

    async fn list_communications(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Vec<LeadCommunication>> {
        let tables = self.tables.read().await;
        Ok(tables
            .communications
            .iter()
            .filter(|c| c.tenant_id == ctx.tenant_id && c.lead_id == lead_id)
            .cloned()
            .collect())
    }
}
