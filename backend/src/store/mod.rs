//! Tenant-scoped repositories used by the automation engines.
//!
//! Every method takes the caller's [`TenantContext`] and never reads across
//! tenants, except the workflow worker queries, which hand back rows that
//! carry their own `tenant_id`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use leadflow_shared::{
    Activity, ActivityLink, AssignmentMember, AssignmentRule, DuplicateStatus, EntityRef, ExecutionStatus, Lead,
    LeadCommunication, LeadDuplicate, LeadStatus, MergeHistoryEntry, Opportunity, OpportunityStatus,
    ScoreHistoryEntry, ScoringRule, WorkflowExecution, WorkflowRule,
};

use crate::tenant::TenantContext;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub const STALE_EXECUTION_ERROR: &str = "execution exceeded the staleness threshold while running";

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Returns the lead unless it is missing or soft-deleted.
    async fn get_lead(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Option<Lead>>;
    async fn insert_lead(&self, ctx: &TenantContext, lead: &Lead) -> StoreResult<()>;
    async fn set_score(&self, ctx: &TenantContext, lead_id: Uuid, score: i32) -> StoreResult<()>;
    async fn set_owner(&self, ctx: &TenantContext, lead_id: Uuid, owner: Option<Uuid>) -> StoreResult<()>;
    async fn set_status(&self, ctx: &TenantContext, lead_id: Uuid, status: LeadStatus) -> StoreResult<()>;
    async fn archive_lead(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<()>;

    /// Live leads sharing a normalised email, phone digits or company with `lead`.
    async fn find_duplicate_candidates(&self, ctx: &TenantContext, lead: &Lead) -> StoreResult<Vec<Lead>>;

    /// Ids of active, non-terminal leads; input to bulk score recalculation.
    async fn list_scorable_leads(&self, ctx: &TenantContext) -> StoreResult<Vec<Uuid>>;

    /// Open (non-terminal, live) lead count per owner. Owners with no leads are absent.
    async fn count_open_leads(&self, ctx: &TenantContext, owners: &[Uuid]) -> StoreResult<HashMap<Uuid, i64>>;

    async fn list_tenants(&self) -> StoreResult<Vec<Uuid>>;
}

#[async_trait]
pub trait ScoringStore: Send + Sync {
    /// Active rules, optionally restricted to one category. Unordered.
    async fn list_active_scoring_rules(
        &self,
        ctx: &TenantContext,
        category: Option<&str>,
    ) -> StoreResult<Vec<ScoringRule>>;
    async fn list_scoring_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<ScoringRule>>;
    async fn get_scoring_rule(&self, ctx: &TenantContext, rule_id: Uuid) -> StoreResult<Option<ScoringRule>>;
    async fn insert_scoring_rule(&self, ctx: &TenantContext, rule: &ScoringRule) -> StoreResult<()>;
    async fn update_scoring_rule(&self, ctx: &TenantContext, rule: &ScoringRule) -> StoreResult<()>;

    async fn append_score_history(&self, ctx: &TenantContext, entry: &ScoreHistoryEntry) -> StoreResult<()>;
    /// History for one lead, oldest first.
    async fn list_score_history(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Vec<ScoreHistoryEntry>>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn list_active_assignment_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<AssignmentRule>>;
    async fn list_assignment_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<AssignmentRule>>;
    async fn get_assignment_rule(&self, ctx: &TenantContext, rule_id: Uuid) -> StoreResult<Option<AssignmentRule>>;
    async fn insert_assignment_rule(&self, ctx: &TenantContext, rule: &AssignmentRule) -> StoreResult<()>;
    /// Updates the definition; the rotation cursor and version are left alone.
    async fn update_assignment_rule(&self, ctx: &TenantContext, rule: &AssignmentRule) -> StoreResult<()>;

    /// Members in stable rotation order (position, then creation time, then id).
    async fn list_members(
        &self,
        ctx: &TenantContext,
        rule_id: Uuid,
        active_only: bool,
    ) -> StoreResult<Vec<AssignmentMember>>;
    /// Appends the member at the end of the rule's rotation and returns it with its position.
    async fn insert_member(&self, ctx: &TenantContext, member: &AssignmentMember) -> StoreResult<AssignmentMember>;
    async fn set_member_active(&self, ctx: &TenantContext, member_id: Uuid, active: bool) -> StoreResult<()>;

    /// Compare-and-swap on the rotation cursor. Returns false when `expected_version`
    /// is stale, in which case nothing was written.
    async fn update_cursor(
        &self,
        ctx: &TenantContext,
        rule_id: Uuid,
        expected_version: i64,
        last_assigned_index: i32,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait DuplicateStore: Send + Sync {
    /// Looks the pair up in both orderings.
    async fn find_duplicate_pair(&self, ctx: &TenantContext, a: Uuid, b: Uuid) -> StoreResult<Option<LeadDuplicate>>;
    /// Returns false when the unordered pair already exists.
    async fn insert_duplicate(&self, ctx: &TenantContext, duplicate: &LeadDuplicate) -> StoreResult<bool>;
    async fn get_duplicate(&self, ctx: &TenantContext, duplicate_id: Uuid) -> StoreResult<Option<LeadDuplicate>>;
    async fn list_duplicates(
        &self,
        ctx: &TenantContext,
        status: Option<DuplicateStatus>,
    ) -> StoreResult<Vec<LeadDuplicate>>;
    async fn resolve_duplicate(
        &self,
        ctx: &TenantContext,
        duplicate_id: Uuid,
        status: DuplicateStatus,
    ) -> StoreResult<Option<LeadDuplicate>>;
}

/// Everything a merge writes, validated and computed up front.
#[derive(Debug, Clone)]
pub struct MergePlan {
    /// Survivor with reconciled field values
    pub survivor: Lead,
    pub loser_ids: Vec<Uuid>,
    pub history: MergeHistoryEntry,
}

#[async_trait]
pub trait MergeStore: Send + Sync {
    /// Writes the history entry, survivor fields, relinked dependents,
    /// soft-deleted losers and resolved suggestions. All or nothing.
    async fn apply_merge(&self, ctx: &TenantContext, plan: &MergePlan) -> StoreResult<()>;
    async fn list_merge_history(&self, ctx: &TenantContext, survivor_id: Uuid) -> StoreResult<Vec<MergeHistoryEntry>>;
}

/// Terminal result recorded by the worker
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn list_active_workflow_rules(
        &self,
        ctx: &TenantContext,
        entity_type: &str,
        trigger_event: &str,
    ) -> StoreResult<Vec<WorkflowRule>>;
    async fn list_workflow_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<WorkflowRule>>;
    /// Includes inactive and deleted rules.
    async fn get_workflow_rule(&self, ctx: &TenantContext, rule_id: Uuid) -> StoreResult<Option<WorkflowRule>>;
    async fn insert_workflow_rule(&self, ctx: &TenantContext, rule: &WorkflowRule) -> StoreResult<()>;
    async fn update_workflow_rule(&self, ctx: &TenantContext, rule: &WorkflowRule) -> StoreResult<()>;

    async fn insert_execution(&self, ctx: &TenantContext, execution: &WorkflowExecution) -> StoreResult<()>;
    async fn get_execution(&self, ctx: &TenantContext, execution_id: Uuid) -> StoreResult<Option<WorkflowExecution>>;
    async fn list_executions(
        &self,
        ctx: &TenantContext,
        status: Option<ExecutionStatus>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowExecution>>;

    /// Pending executions due at `now`, across tenants, oldest schedule first.
    async fn due_executions(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<WorkflowExecution>>;
    /// Pending -> Running. Returns false if another worker got there first.
    async fn claim_execution(&self, execution_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;
    /// Running -> Completed | Failed. Returns false if the row was not Running.
    async fn finish_execution(
        &self,
        execution_id: Uuid,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Fails Running executions claimed before `claimed_before`; returns how many.
    async fn fail_stale_executions(&self, claimed_before: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn insert_activity(&self, ctx: &TenantContext, activity: &Activity, links: &[EntityRef]) -> StoreResult<()>;
    async fn list_activity_links(&self, ctx: &TenantContext, entity: &EntityRef) -> StoreResult<Vec<ActivityLink>>;
    async fn get_activity(&self, ctx: &TenantContext, activity_id: Uuid) -> StoreResult<Option<Activity>>;
    async fn set_activity_owner(&self, ctx: &TenantContext, activity_id: Uuid, owner: Uuid) -> StoreResult<()>;
    async fn get_opportunity(&self, ctx: &TenantContext, opportunity_id: Uuid) -> StoreResult<Option<Opportunity>>;
    async fn set_opportunity_status(
        &self,
        ctx: &TenantContext,
        opportunity_id: Uuid,
        status: OpportunityStatus,
    ) -> StoreResult<()>;
    async fn insert_opportunity(&self, ctx: &TenantContext, opportunity: &Opportunity) -> StoreResult<()>;
    async fn list_opportunities_for_lead(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Vec<Opportunity>>;
    async fn insert_communication(&self, ctx: &TenantContext, communication: &LeadCommunication) -> StoreResult<()>;
    async fn list_communications(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Vec<LeadCommunication>>;
}

/// Every repository the engines need, behind one object.
pub trait Store:
    LeadStore + ScoringStore + AssignmentStore + DuplicateStore + MergeStore + WorkflowStore + ActivityStore
{
}

impl<T> Store for T where
    T: LeadStore + ScoringStore + AssignmentStore + DuplicateStore + MergeStore + WorkflowStore + ActivityStore
{
}

pub type SharedStore = Arc<dyn Store>;

/// Lowercased, trimmed email; `None` when blank.
pub fn normalize_email(email: Option<&str>) -> Option<String> {
    email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
}

/// Digits only; `None` when fewer than five digits remain.
pub fn normalize_phone(phone: Option<&str>) -> Option<String> {
    let digits: String = phone?.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 5 { Some(digits) } else { None }
}

/// Lowercase, punctuation stripped, whitespace collapsed.
pub fn normalize_text(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_lowercase().next().unwrap_or(c) } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalize_company(company: Option<&str>) -> Option<String> {
    company.map(normalize_text).filter(|c| !c.is_empty())
}
