use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use leadflow_shared::{
    Activity, ActivityLink, AssignmentMember, AssignmentRule, DuplicateStatus, EntityRef, ExecutionStatus, Lead,
    LeadCommunication, LeadDuplicate, LeadStatus, MergeHistoryEntry, Opportunity, OpportunityStatus,
    ScoreHistoryEntry, ScoringRule, WorkflowExecution, WorkflowRule, entity_types, ordered_pair,
};

use super::{
    ActivityStore, AssignmentStore, DuplicateStore, ExecutionOutcome, LeadStore, MergePlan, MergeStore,
    STALE_EXECUTION_ERROR, ScoringStore, StoreError, StoreResult, WorkflowStore, normalize_company,
    normalize_email, normalize_phone,
};
use crate::tenant::TenantContext;

/// Postgres-backed repositories. Every statement carries the tenant predicate
/// except the cross-tenant worker queries on `workflow_executions`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn lead_updated(result: sqlx::postgres::PgQueryResult, lead_id: Uuid) -> StoreResult<()> {
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("Lead {}", lead_id)));
    }
    Ok(())
}

#[async_trait]
impl LeadStore for PgStore {
    async fn get_lead(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Option<Lead>> {
        let lead = sqlx::query_as::<_, Lead>(
            "SELECT * FROM leads WHERE tenant_id = $1 AND id = $2 AND is_deleted = FALSE",
        )
        .bind(ctx.tenant_id)
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(lead)
    }

    async fn insert_lead(&self, ctx: &TenantContext, lead: &Lead) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO leads (
                id, tenant_id, first_name, last_name, email, phone, company_name, job_title, source,
                status, score, assigned_to, estimated_value, address, city, state, country, postal_code,
                notes, attributes, is_active, is_deleted, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                    $19, $20, $21, $22, $23, $24, $25)
            "#,
        )
        .bind(lead.id)
        .bind(ctx.tenant_id)
        .bind(&lead.first_name)
        .bind(&lead.last_name)
        .bind(&lead.email)
        .bind(&lead.phone)
        .bind(&lead.company_name)
        .bind(&lead.job_title)
        .bind(&lead.source)
        .bind(lead.status)
        .bind(lead.score)
        .bind(lead.assigned_to)
        .bind(lead.estimated_value)
        .bind(&lead.address)
        .bind(&lead.city)
        .bind(&lead.state)
        .bind(&lead.country)
        .bind(&lead.postal_code)
        .bind(&lead.notes)
        .bind(&lead.attributes)
        .bind(lead.is_active)
        .bind(lead.is_deleted)
        .bind(lead.created_by)
        .bind(lead.created_at)
        .bind(lead.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_score(&self, ctx: &TenantContext, lead_id: Uuid, score: i32) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE leads SET score = $3, updated_at = NOW() WHERE tenant_id = $1 AND id = $2 AND is_deleted = FALSE",
        )
        .bind(ctx.tenant_id)
        .bind(lead_id)
        .bind(score)
        .execute(&self.pool)
        .await?;
        lead_updated(result, lead_id)
    }

    async fn set_owner(&self, ctx: &TenantContext, lead_id: Uuid, owner: Option<Uuid>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE leads SET assigned_to = $3, updated_at = NOW() WHERE tenant_id = $1 AND id = $2 AND is_deleted = FALSE",
        )
        .bind(ctx.tenant_id)
        .bind(lead_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        lead_updated(result, lead_id)
    }

    async fn set_status(&self, ctx: &TenantContext, lead_id: Uuid, status: LeadStatus) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE leads SET status = $3, updated_at = NOW() WHERE tenant_id = $1 AND id = $2 AND is_deleted = FALSE",
        )
        .bind(ctx.tenant_id)
        .bind(lead_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        lead_updated(result, lead_id)
    }

    async fn archive_lead(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE leads SET is_active = FALSE, updated_at = NOW() WHERE tenant_id = $1 AND id = $2 AND is_deleted = FALSE",
        )
        .bind(ctx.tenant_id)
        .bind(lead_id)
        .execute(&self.pool)
        .await?;
        lead_updated(result, lead_id)
    }

    async fn find_duplicate_candidates(&self, ctx: &TenantContext, lead: &Lead) -> StoreResult<Vec<Lead>> {
        let email = normalize_email(lead.email.as_deref());
        let phone = normalize_phone(lead.phone.as_deref());
        let company = normalize_company(lead.company_name.as_deref());

        if email.is_none() && phone.is_none() && company.is_none() {
            return Ok(Vec::new());
        }

        let candidates = sqlx::query_as::<_, Lead>(
            r#"
            SELECT * FROM leads
            WHERE tenant_id = $1
              AND id <> $2
              AND is_deleted = FALSE
              AND (
                   ($3::text IS NOT NULL AND LOWER(TRIM(email)) = $3)
                OR ($4::text IS NOT NULL AND regexp_replace(COALESCE(phone, ''), '\D', '', 'g') = $4)
                OR ($5::text IS NOT NULL
                    AND TRIM(regexp_replace(LOWER(COALESCE(company_name, '')), '[^[:alnum:]]+', ' ', 'g')) = $5)
              )
            ORDER BY created_at, id
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(lead.id)
        .bind(email)
        .bind(phone)
        .bind(company)
        .fetch_all(&self.pool)
        .await?;
        Ok(candidates)
    }

    async fn list_scorable_leads(&self, ctx: &TenantContext) -> StoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM leads
            WHERE tenant_id = $1 AND is_active = TRUE AND is_deleted = FALSE
              AND status NOT IN ('converted', 'lost')
            "#,
        )
        .bind(ctx.tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn count_open_leads(&self, ctx: &TenantContext, owners: &[Uuid]) -> StoreResult<HashMap<Uuid, i64>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT assigned_to, COUNT(*)
            FROM leads
            WHERE tenant_id = $1 AND assigned_to = ANY($2) AND is_deleted = FALSE
              AND status NOT IN ('converted', 'lost')
            GROUP BY assigned_to
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(owners)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn list_tenants(&self) -> StoreResult<Vec<Uuid>> {
        let tenants = sqlx::query_scalar("SELECT DISTINCT tenant_id FROM leads WHERE is_deleted = FALSE")
            .fetch_all(&self.pool)
            .await?;
        Ok(tenants)
    }
}

#[async_trait]
impl ScoringStore for PgStore {
    async fn list_active_scoring_rules(
        &self,
        ctx: &TenantContext,
        category: Option<&str>,
    ) -> StoreResult<Vec<ScoringRule>> {
        // No ORDER BY: sort_order is not reliable in every deployment, the engine sorts.
        let rules = sqlx::query_as::<_, ScoringRule>(
            r#"
            SELECT * FROM scoring_rules
            WHERE tenant_id = $1 AND is_active = TRUE
              AND ($2::text IS NULL OR LOWER(category) = LOWER($2))
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(category)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn list_scoring_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<ScoringRule>> {
        let rules = sqlx::query_as::<_, ScoringRule>(
            "SELECT * FROM scoring_rules WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(ctx.tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn get_scoring_rule(&self, ctx: &TenantContext, rule_id: Uuid) -> StoreResult<Option<ScoringRule>> {
        let rule = sqlx::query_as::<_, ScoringRule>("SELECT * FROM scoring_rules WHERE tenant_id = $1 AND id = $2")
            .bind(ctx.tenant_id)
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(rule)
    }

    async fn insert_scoring_rule(&self, ctx: &TenantContext, rule: &ScoringRule) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scoring_rules (
                id, tenant_id, name, category, condition, score_delta, decay_days, sort_order,
                is_active, created_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(rule.id)
        .bind(ctx.tenant_id)
        .bind(&rule.name)
        .bind(&rule.category)
        .bind(&rule.condition)
        .bind(rule.score_delta)
        .bind(rule.decay_days)
        .bind(rule.sort_order)
        .bind(rule.is_active)
        .bind(rule.created_by)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_scoring_rule(&self, ctx: &TenantContext, rule: &ScoringRule) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scoring_rules
            SET name = $3, category = $4, condition = $5, score_delta = $6, decay_days = $7,
                sort_order = $8, is_active = $9, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.category)
        .bind(&rule.condition)
        .bind(rule.score_delta)
        .bind(rule.decay_days)
        .bind(rule.sort_order)
        .bind(rule.is_active)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Scoring rule {}", rule.id)));
        }
        Ok(())
    }

    async fn append_score_history(&self, ctx: &TenantContext, entry: &ScoreHistoryEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO score_history (
                id, tenant_id, lead_id, rule_id, previous_score, new_score, score_delta,
                decay_days, reason, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(ctx.tenant_id)
        .bind(entry.lead_id)
        .bind(entry.rule_id)
        .bind(entry.previous_score)
        .bind(entry.new_score)
        .bind(entry.score_delta)
        .bind(entry.decay_days)
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_score_history(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Vec<ScoreHistoryEntry>> {
        let history = sqlx::query_as::<_, ScoreHistoryEntry>(
            "SELECT * FROM score_history WHERE tenant_id = $1 AND lead_id = $2 ORDER BY created_at, id",
        )
        .bind(ctx.tenant_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(history)
    }
}

#[async_trait]
impl AssignmentStore for PgStore {
    async fn list_active_assignment_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<AssignmentRule>> {
        let rules = sqlx::query_as::<_, AssignmentRule>(
            "SELECT * FROM assignment_rules WHERE tenant_id = $1 AND is_active = TRUE",
        )
        .bind(ctx.tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn list_assignment_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<AssignmentRule>> {
        let rules = sqlx::query_as::<_, AssignmentRule>(
            "SELECT * FROM assignment_rules WHERE tenant_id = $1 ORDER BY priority, id",
        )
        .bind(ctx.tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn get_assignment_rule(&self, ctx: &TenantContext, rule_id: Uuid) -> StoreResult<Option<AssignmentRule>> {
        let rule =
            sqlx::query_as::<_, AssignmentRule>("SELECT * FROM assignment_rules WHERE tenant_id = $1 AND id = $2")
                .bind(ctx.tenant_id)
                .bind(rule_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(rule)
    }

    async fn insert_assignment_rule(&self, ctx: &TenantContext, rule: &AssignmentRule) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO assignment_rules (
                id, tenant_id, name, assignment_type, criteria, skill_attribute, priority,
                last_assigned_index, version, is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(rule.id)
        .bind(ctx.tenant_id)
        .bind(&rule.name)
        .bind(rule.assignment_type)
        .bind(&rule.criteria)
        .bind(&rule.skill_attribute)
        .bind(rule.priority)
        .bind(rule.last_assigned_index)
        .bind(rule.version)
        .bind(rule.is_active)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_assignment_rule(&self, ctx: &TenantContext, rule: &AssignmentRule) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE assignment_rules
            SET name = $3, assignment_type = $4, criteria = $5, skill_attribute = $6,
                priority = $7, is_active = $8, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.assignment_type)
        .bind(&rule.criteria)
        .bind(&rule.skill_attribute)
        .bind(rule.priority)
        .bind(rule.is_active)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Assignment rule {}", rule.id)));
        }
        Ok(())
    }

    async fn list_members(
        &self,
        ctx: &TenantContext,
        rule_id: Uuid,
        active_only: bool,
    ) -> StoreResult<Vec<AssignmentMember>> {
        let members = sqlx::query_as::<_, AssignmentMember>(
            r#"
            SELECT * FROM assignment_members
            WHERE tenant_id = $1 AND rule_id = $2 AND (NOT $3 OR is_active = TRUE)
            ORDER BY position, created_at, id
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(rule_id)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn insert_member(&self, ctx: &TenantContext, member: &AssignmentMember) -> StoreResult<AssignmentMember> {
        let inserted = sqlx::query_as::<_, AssignmentMember>(
            r#"
            INSERT INTO assignment_members (
                id, tenant_id, rule_id, user_id, max_capacity, skill_level, position, is_active, created_at
            )
            SELECT $1, $2, $3, $4, $5, $6,
                   (SELECT COALESCE(MAX(position) + 1, 0) FROM assignment_members WHERE rule_id = $3),
                   $7, $8
            WHERE EXISTS (SELECT 1 FROM assignment_rules WHERE tenant_id = $2 AND id = $3)
            RETURNING *
            "#,
        )
        .bind(member.id)
        .bind(ctx.tenant_id)
        .bind(member.rule_id)
        .bind(member.user_id)
        .bind(member.max_capacity)
        .bind(&member.skill_level)
        .bind(member.is_active)
        .bind(member.created_at)
        .fetch_optional(&self.pool)
        .await?;

        inserted.ok_or_else(|| StoreError::NotFound(format!("Assignment rule {}", member.rule_id)))
    }

    async fn set_member_active(&self, ctx: &TenantContext, member_id: Uuid, active: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE assignment_members SET is_active = $3 WHERE tenant_id = $1 AND id = $2")
            .bind(ctx.tenant_id)
            .bind(member_id)
            .bind(active)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Assignment member {}", member_id)));
        }
        Ok(())
    }

    async fn update_cursor(
        &self,
        ctx: &TenantContext,
        rule_id: Uuid,
        expected_version: i64,
        last_assigned_index: i32,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE assignment_rules
            SET last_assigned_index = $4, version = version + 1, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2 AND version = $3
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(rule_id)
        .bind(expected_version)
        .bind(last_assigned_index)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get_assignment_rule(ctx, rule_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("Assignment rule {}", rule_id))),
        }
    }
}

#[async_trait]
impl DuplicateStore for PgStore {
    async fn find_duplicate_pair(&self, ctx: &TenantContext, a: Uuid, b: Uuid) -> StoreResult<Option<LeadDuplicate>> {
        let duplicate = sqlx::query_as::<_, LeadDuplicate>(
            r#"
            SELECT * FROM lead_duplicates
            WHERE tenant_id = $1
              AND ((lead1_id = $2 AND lead2_id = $3) OR (lead1_id = $3 AND lead2_id = $2))
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(a)
        .bind(b)
        .fetch_optional(&self.pool)
        .await?;
        Ok(duplicate)
    }

    async fn insert_duplicate(&self, ctx: &TenantContext, duplicate: &LeadDuplicate) -> StoreResult<bool> {
        let (first, second) = ordered_pair(duplicate.lead1_id, duplicate.lead2_id);
        let result = sqlx::query(
            r#"
            INSERT INTO lead_duplicates (
                id, tenant_id, lead1_id, lead2_id, match_type, confidence_score, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, lead1_id, lead2_id) DO NOTHING
            "#,
        )
        .bind(duplicate.id)
        .bind(ctx.tenant_id)
        .bind(first)
        .bind(second)
        .bind(duplicate.match_type)
        .bind(duplicate.confidence_score)
        .bind(duplicate.status)
        .bind(duplicate.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_duplicate(&self, ctx: &TenantContext, duplicate_id: Uuid) -> StoreResult<Option<LeadDuplicate>> {
        let duplicate =
            sqlx::query_as::<_, LeadDuplicate>("SELECT * FROM lead_duplicates WHERE tenant_id = $1 AND id = $2")
                .bind(ctx.tenant_id)
                .bind(duplicate_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(duplicate)
    }

    async fn list_duplicates(
        &self,
        ctx: &TenantContext,
        status: Option<DuplicateStatus>,
    ) -> StoreResult<Vec<LeadDuplicate>> {
        let duplicates = sqlx::query_as::<_, LeadDuplicate>(
            r#"
            SELECT * FROM lead_duplicates
            WHERE tenant_id = $1 AND ($2::duplicate_status IS NULL OR status = $2)
            ORDER BY confidence_score DESC, created_at
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(duplicates)
    }

    async fn resolve_duplicate(
        &self,
        ctx: &TenantContext,
        duplicate_id: Uuid,
        status: DuplicateStatus,
    ) -> StoreResult<Option<LeadDuplicate>> {
        let duplicate = sqlx::query_as::<_, LeadDuplicate>(
            r#"
            UPDATE lead_duplicates
            SET status = $3, resolved_at = NOW(), resolved_by = $4
            WHERE tenant_id = $1 AND id = $2
            RETURNING *
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(duplicate_id)
        .bind(status)
        .bind(ctx.actor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(duplicate)
    }
}

#[async_trait]
impl MergeStore for PgStore {
    async fn apply_merge(&self, ctx: &TenantContext, plan: &MergePlan) -> StoreResult<()> {
        let survivor = &plan.survivor;
        let mut all_ids = vec![survivor.id];
        all_ids.extend(plan.loser_ids.iter().copied());

        let mut tx = self.pool.begin().await?;

        // Lock every participant; a concurrent merge of the same leads waits here.
        let locked: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM leads WHERE tenant_id = $1 AND id = ANY($2) AND is_deleted = FALSE FOR UPDATE",
        )
        .bind(ctx.tenant_id)
        .bind(&all_ids)
        .fetch_all(&mut *tx)
        .await?;

        if let Some(missing) = all_ids.iter().find(|id| !locked.contains(id)) {
            return Err(StoreError::NotFound(format!("Lead {}", missing)));
        }

        sqlx::query(
            r#"
            INSERT INTO merge_history (id, tenant_id, survivor_id, merged_lead_ids, snapshot, merged_by, merged_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(plan.history.id)
        .bind(ctx.tenant_id)
        .bind(plan.history.survivor_id)
        .bind(&plan.history.merged_lead_ids)
        .bind(&plan.history.snapshot)
        .bind(plan.history.merged_by)
        .bind(plan.history.merged_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE leads
            SET first_name = $3, last_name = $4, email = $5, phone = $6, company_name = $7,
                job_title = $8, source = $9, assigned_to = $10, estimated_value = $11, address = $12,
                city = $13, state = $14, country = $15, postal_code = $16, notes = $17,
                attributes = $18, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(survivor.id)
        .bind(&survivor.first_name)
        .bind(&survivor.last_name)
        .bind(&survivor.email)
        .bind(&survivor.phone)
        .bind(&survivor.company_name)
        .bind(&survivor.job_title)
        .bind(&survivor.source)
        .bind(survivor.assigned_to)
        .bind(survivor.estimated_value)
        .bind(&survivor.address)
        .bind(&survivor.city)
        .bind(&survivor.state)
        .bind(&survivor.country)
        .bind(&survivor.postal_code)
        .bind(&survivor.notes)
        .bind(&survivor.attributes)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE activity_links SET entity_id = $2
            WHERE tenant_id = $1 AND entity_type = $3 AND entity_id = ANY($4)
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(survivor.id)
        .bind(entity_types::LEAD)
        .bind(&plan.loser_ids)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE opportunities SET lead_id = $2, updated_at = NOW()
            WHERE tenant_id = $1 AND status = 'open' AND lead_id = ANY($3)
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(survivor.id)
        .bind(&plan.loser_ids)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE lead_communications SET lead_id = $2 WHERE tenant_id = $1 AND lead_id = ANY($3)")
            .bind(ctx.tenant_id)
            .bind(survivor.id)
            .bind(&plan.loser_ids)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE leads SET is_deleted = TRUE, is_active = FALSE, updated_at = NOW()
            WHERE tenant_id = $1 AND id = ANY($2)
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(&plan.loser_ids)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE lead_duplicates
            SET status = 'confirmed', resolved_at = NOW(), resolved_by = $3
            WHERE tenant_id = $1 AND status = 'pending'
              AND (lead1_id = ANY($2) OR lead2_id = ANY($2))
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(&plan.loser_ids)
        .bind(ctx.actor_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_merge_history(&self, ctx: &TenantContext, survivor_id: Uuid) -> StoreResult<Vec<MergeHistoryEntry>> {
        let history = sqlx::query_as::<_, MergeHistoryEntry>(
            "SELECT * FROM merge_history WHERE tenant_id = $1 AND survivor_id = $2 ORDER BY merged_at",
        )
        .bind(ctx.tenant_id)
        .bind(survivor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(history)
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn list_active_workflow_rules(
        &self,
        ctx: &TenantContext,
        entity_type: &str,
        trigger_event: &str,
    ) -> StoreResult<Vec<WorkflowRule>> {
        let rules = sqlx::query_as::<_, WorkflowRule>(
            r#"
            SELECT * FROM workflow_rules
            WHERE tenant_id = $1 AND is_active = TRUE AND is_deleted = FALSE
              AND LOWER(entity_type) = LOWER($2) AND LOWER(trigger_event) = LOWER($3)
            ORDER BY created_at, id
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(entity_type)
        .bind(trigger_event)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn list_workflow_rules(&self, ctx: &TenantContext) -> StoreResult<Vec<WorkflowRule>> {
        let rules = sqlx::query_as::<_, WorkflowRule>(
            "SELECT * FROM workflow_rules WHERE tenant_id = $1 AND is_deleted = FALSE ORDER BY created_at",
        )
        .bind(ctx.tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn get_workflow_rule(&self, ctx: &TenantContext, rule_id: Uuid) -> StoreResult<Option<WorkflowRule>> {
        let rule = sqlx::query_as::<_, WorkflowRule>("SELECT * FROM workflow_rules WHERE tenant_id = $1 AND id = $2")
            .bind(ctx.tenant_id)
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(rule)
    }

    async fn insert_workflow_rule(&self, ctx: &TenantContext, rule: &WorkflowRule) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_rules (
                id, tenant_id, name, entity_type, trigger_event, condition, action_type,
                action_config, delay_minutes, is_active, is_deleted, created_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(rule.id)
        .bind(ctx.tenant_id)
        .bind(&rule.name)
        .bind(&rule.entity_type)
        .bind(&rule.trigger_event)
        .bind(&rule.condition)
        .bind(&rule.action_type)
        .bind(&rule.action_config)
        .bind(rule.delay_minutes)
        .bind(rule.is_active)
        .bind(rule.is_deleted)
        .bind(rule.created_by)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_workflow_rule(&self, ctx: &TenantContext, rule: &WorkflowRule) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_rules
            SET name = $3, entity_type = $4, trigger_event = $5, condition = $6, action_type = $7,
                action_config = $8, delay_minutes = $9, is_active = $10, is_deleted = $11, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.entity_type)
        .bind(&rule.trigger_event)
        .bind(&rule.condition)
        .bind(&rule.action_type)
        .bind(&rule.action_config)
        .bind(rule.delay_minutes)
        .bind(rule.is_active)
        .bind(rule.is_deleted)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Workflow rule {}", rule.id)));
        }
        Ok(())
    }

    async fn insert_execution(&self, ctx: &TenantContext, execution: &WorkflowExecution) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                id, tenant_id, rule_id, entity_type, entity_id, snapshot, status, scheduled_for, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(execution.id)
        .bind(ctx.tenant_id)
        .bind(execution.rule_id)
        .bind(&execution.entity_type)
        .bind(execution.entity_id)
        .bind(&execution.snapshot)
        .bind(execution.status)
        .bind(execution.scheduled_for)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, ctx: &TenantContext, execution_id: Uuid) -> StoreResult<Option<WorkflowExecution>> {
        let execution = sqlx::query_as::<_, WorkflowExecution>(
            "SELECT * FROM workflow_executions WHERE tenant_id = $1 AND id = $2",
        )
        .bind(ctx.tenant_id)
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(execution)
    }

    async fn list_executions(
        &self,
        ctx: &TenantContext,
        status: Option<ExecutionStatus>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowExecution>> {
        let executions = sqlx::query_as::<_, WorkflowExecution>(
            r#"
            SELECT * FROM workflow_executions
            WHERE tenant_id = $1 AND ($2::execution_status IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(executions)
    }

    async fn due_executions(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<WorkflowExecution>> {
        let executions = sqlx::query_as::<_, WorkflowExecution>(
            r#"
            SELECT * FROM workflow_executions
            WHERE status = 'pending' AND scheduled_for <= $1
            ORDER BY scheduled_for, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(executions)
    }

    async fn claim_execution(&self, execution_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_executions SET status = 'running', claimed_at = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(execution_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if !outcome.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "{:?} is not a terminal execution status",
                outcome.status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $2, executed_on = $3, result = $4, error = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(outcome.status)
        .bind(now)
        .bind(&outcome.result)
        .bind(&outcome.error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_stale_executions(&self, claimed_before: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'failed', executed_on = $2, error = $3
            WHERE status = 'running' AND claimed_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .bind(STALE_EXECUTION_ERROR)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ActivityStore for PgStore {
    async fn insert_activity(&self, ctx: &TenantContext, activity: &Activity, links: &[EntityRef]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO activities (
                id, tenant_id, activity_type, subject, description, status, priority, assigned_to,
                scheduled_on, due_date, created_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(activity.id)
        .bind(ctx.tenant_id)
        .bind(&activity.activity_type)
        .bind(&activity.subject)
        .bind(&activity.description)
        .bind(&activity.status)
        .bind(&activity.priority)
        .bind(activity.assigned_to)
        .bind(activity.scheduled_on)
        .bind(activity.due_date)
        .bind(activity.created_by)
        .bind(activity.created_at)
        .execute(&mut *tx)
        .await?;

        for entity in links {
            sqlx::query(
                r#"
                INSERT INTO activity_links (id, tenant_id, activity_id, entity_type, entity_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(ctx.tenant_id)
            .bind(activity.id)
            .bind(&entity.entity_type)
            .bind(entity.entity_id)
            .bind(activity.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_activity_links(&self, ctx: &TenantContext, entity: &EntityRef) -> StoreResult<Vec<ActivityLink>> {
        let links = sqlx::query_as::<_, ActivityLink>(
            r#"
            SELECT id, tenant_id, activity_id, entity_type, entity_id, created_at
            FROM activity_links
            WHERE tenant_id = $1 AND entity_type = $2 AND entity_id = $3
            ORDER BY created_at
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(&entity.entity_type)
        .bind(entity.entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    async fn get_activity(&self, ctx: &TenantContext, activity_id: Uuid) -> StoreResult<Option<Activity>> {
        let activity = sqlx::query_as::<_, Activity>("SELECT * FROM activities WHERE tenant_id = $1 AND id = $2")
            .bind(ctx.tenant_id)
            .bind(activity_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(activity)
    }

    async fn set_activity_owner(&self, ctx: &TenantContext, activity_id: Uuid, owner: Uuid) -> StoreResult<()> {
        let result = sqlx::query("UPDATE activities SET assigned_to = $3 WHERE tenant_id = $1 AND id = $2")
            .bind(ctx.tenant_id)
            .bind(activity_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Activity {}", activity_id)));
        }
        Ok(())
    }

    async fn get_opportunity(&self, ctx: &TenantContext, opportunity_id: Uuid) -> StoreResult<Option<Opportunity>> {
        let opportunity =
            sqlx::query_as::<_, Opportunity>("SELECT * FROM opportunities WHERE tenant_id = $1 AND id = $2")
                .bind(ctx.tenant_id)
                .bind(opportunity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(opportunity)
    }

    async fn set_opportunity_status(
        &self,
        ctx: &TenantContext,
        opportunity_id: Uuid,
        status: OpportunityStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE opportunities SET status = $3, updated_at = NOW() WHERE tenant_id = $1 AND id = $2",
        )
        .bind(ctx.tenant_id)
        .bind(opportunity_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Opportunity {}", opportunity_id)));
        }
        Ok(())
    }

    async fn insert_opportunity(&self, ctx: &TenantContext, opportunity: &Opportunity) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO opportunities (id, tenant_id, lead_id, name, status, amount, assigned_to, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(opportunity.id)
        .bind(ctx.tenant_id)
        .bind(opportunity.lead_id)
        .bind(&opportunity.name)
        .bind(opportunity.status)
        .bind(opportunity.amount)
        .bind(opportunity.assigned_to)
        .bind(opportunity.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_opportunities_for_lead(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Vec<Opportunity>> {
        let opportunities = sqlx::query_as::<_, Opportunity>(
            "SELECT * FROM opportunities WHERE tenant_id = $1 AND lead_id = $2 ORDER BY created_at",
        )
        .bind(ctx.tenant_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(opportunities)
    }

    async fn insert_communication(&self, ctx: &TenantContext, communication: &LeadCommunication) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lead_communications (id, tenant_id, lead_id, channel, subject, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(communication.id)
        .bind(ctx.tenant_id)
        .bind(communication.lead_id)
        .bind(&communication.channel)
        .bind(&communication.subject)
        .bind(communication.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_communications(&self, ctx: &TenantContext, lead_id: Uuid) -> StoreResult<Vec<LeadCommunication>> {
        let communications = sqlx::query_as::<_, LeadCommunication>(
            "SELECT * FROM lead_communications WHERE tenant_id = $1 AND lead_id = $2 ORDER BY created_at",
        )
        .bind(ctx.tenant_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(communications)
    }
}
