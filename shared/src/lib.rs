use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity type tags used by workflow rules and polymorphic activity links.
pub mod entity_types {
    pub const LEAD: &str = "Lead";
    pub const ACCOUNT: &str = "Account";
    pub const CONTACT: &str = "Contact";
    pub const OPPORTUNITY: &str = "Opportunity";
    pub const ACTIVITY: &str = "Activity";
}

// ==================== Leads ====================

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "lead_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Converted,
    Lost,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Qualified => "qualified",
            Self::Converted => "converted",
            Self::Lost => "lost",
        }
    }

    /// Converted and Lost leads no longer count towards an owner's open load.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converted | Self::Lost)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "new" => Some(Self::New),
            "contacted" => Some(Self::Contacted),
            "qualified" => Some(Self::Qualified),
            "converted" => Some(Self::Converted),
            "lost" => Some(Self::Lost),
            _ => None,
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company_name: Option<String>,
    pub job_title: Option<String>,
    pub source: Option<String>,
    pub status: LeadStatus,
    pub score: i32,
    pub assigned_to: Option<Uuid>,
    pub estimated_value: Option<Decimal>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
    pub notes: Option<String>,
    /// Free-form attributes (deal size tier, campaign, ...) exposed to conditions.
    pub attributes: serde_json::Value,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Lead {
    pub fn new(tenant_id: Uuid, first_name: &str, last_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: None,
            phone: None,
            company_name: None,
            job_title: None,
            source: None,
            status: LeadStatus::New,
            score: 0,
            assigned_to: None,
            estimated_value: None,
            address: None,
            city: None,
            state: None,
            country: None,
            postal_code: None,
            notes: None,
            attributes: serde_json::json!({}),
            is_active: true,
            is_deleted: false,
            created_by: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    /// Flat field map used for condition evaluation and workflow payloads.
    /// Attribute keys are merged in but never shadow a core field.
    pub fn to_snapshot(&self) -> serde_json::Value {
        let mut snapshot = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));

        if let Some(map) = snapshot.as_object_mut() {
            map.remove("attributes");
            map.insert("full_name".to_string(), serde_json::json!(self.full_name()));

            let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
            map.insert("has_email".to_string(), serde_json::json!(present(&self.email)));
            map.insert("has_phone".to_string(), serde_json::json!(present(&self.phone)));
            map.insert("has_company_name".to_string(), serde_json::json!(present(&self.company_name)));
            map.insert("has_job_title".to_string(), serde_json::json!(present(&self.job_title)));
            map.insert(
                "has_address".to_string(),
                serde_json::json!(present(&self.city) || present(&self.country)),
            );

            if let Some(attributes) = self.attributes.as_object() {
                for (key, value) in attributes {
                    map.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        snapshot
    }
}

// ==================== Scoring ====================

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub category: String,
    /// Raw condition document; parsed by the evaluator at scoring time.
    pub condition: serde_json::Value,
    pub score_delta: i32,
    pub decay_days: Option<i32>,
    /// Not populated in every deployment, hence optional.
    pub sort_order: Option<i32>,
    pub is_active: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreHistoryEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub lead_id: Uuid,
    /// None for manual adjustments.
    pub rule_id: Option<Uuid>,
    pub previous_score: i32,
    pub new_score: i32,
    pub score_delta: i32,
    /// Copied from the rule when the entry is written; later rule edits do not touch history.
    pub decay_days: Option<i32>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ==================== Assignment ====================

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "assignment_type", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    RoundRobin,
    LoadBalanced,
    SkillBased,
}

impl AssignmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LoadBalanced => "load_balanced",
            Self::SkillBased => "skill_based",
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub assignment_type: AssignmentType,
    pub criteria: Option<serde_json::Value>,
    /// Lead field compared against member skill levels for skill-based rules.
    pub skill_attribute: Option<String>,
    /// Lower values are evaluated first.
    pub priority: i32,
    /// Rotation cursor, -1 before the first assignment.
    pub last_assigned_index: i32,
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentMember {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub rule_id: Uuid,
    pub user_id: Uuid,
    pub max_capacity: i32,
    pub skill_level: Option<String>,
    /// Insertion order within the rule; keeps rotation deterministic.
    pub position: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ==================== Duplicates & merge ====================

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "duplicate_match_type", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Email,
    NamePhone,
    Fuzzy,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "duplicate_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateStatus {
    Pending,
    Confirmed,
    Dismissed,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadDuplicate {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Always the smaller id of the pair.
    pub lead1_id: Uuid,
    pub lead2_id: Uuid,
    pub match_type: MatchType,
    pub confidence_score: i32,
    pub status: DuplicateStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
}

impl LeadDuplicate {
    /// Builds a pending suggestion with the pair stored in canonical order.
    pub fn between(tenant_id: Uuid, a: Uuid, b: Uuid, match_type: MatchType, confidence_score: i32) -> Self {
        let (lead1_id, lead2_id) = ordered_pair(a, b);
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            lead1_id,
            lead2_id,
            match_type,
            confidence_score,
            status: DuplicateStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn involves(&self, lead_id: Uuid) -> bool {
        self.lead1_id == lead_id || self.lead2_id == lead_id
    }
}

pub fn ordered_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeHistoryEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub survivor_id: Uuid,
    pub merged_lead_ids: Vec<Uuid>,
    /// Array of the merged leads exactly as they were before the merge.
    pub snapshot: serde_json::Value,
    pub merged_by: Option<Uuid>,
    pub merged_at: DateTime<Utc>,
}

// ==================== Workflow ====================

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub entity_type: String,
    pub trigger_event: String,
    pub condition: Option<serde_json::Value>,
    pub action_type: String,
    pub action_config: serde_json::Value,
    /// Zero runs the action at the next dispatch tick.
    pub delay_minutes: i32,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "execution_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    /// Executions only move forward: Pending -> Running -> Completed | Failed.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub rule_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    /// Target entity as it looked when the rule fired.
    pub snapshot: serde_json::Value,
    pub status: ExecutionStatus,
    pub scheduled_for: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub executed_on: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ==================== Activities, opportunities, communications ====================

/// Polymorphic pointer to any CRM record. No foreign key; looked up by (entity_type, entity_id).
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: Uuid,
}

impl EntityRef {
    pub fn new(entity_type: &str, entity_id: Uuid) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id,
        }
    }

    pub fn lead(lead_id: Uuid) -> Self {
        Self::new(entity_types::LEAD, lead_id)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub activity_type: String,
    pub subject: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: Option<String>,
    pub assigned_to: Option<Uuid>,
    pub scheduled_on: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLink {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub activity_id: Uuid,
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    #[serde(flatten)]
    pub entity: EntityRef,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "opportunity_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    Open,
    Won,
    Lost,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Won => "won",
            Self::Lost => "lost",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "open" => Some(Self::Open),
            "won" | "closed_won" => Some(Self::Won),
            "lost" | "closed_lost" => Some(Self::Lost),
            _ => None,
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub name: String,
    pub status: OpportunityStatus,
    pub amount: Option<Decimal>,
    pub assigned_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadCommunication {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub lead_id: Uuid,
    pub channel: String,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
}
