//! Rule-based lead assignment.
//!
//! The rotation cursor on each rule is shared state. It is advanced with a
//! compare-and-swap on the rule's version; on conflict the rule and its member
//! list are re-read and the selection is recomputed, so the cursor is always
//! interpreted against the members that are active at that moment.

use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use leadflow_shared::{AssignmentMember, AssignmentRule, AssignmentType, Lead, entity_types};

use super::conditions::{ConditionSet, field_value};
use super::notifier::{ChangeEvent, ChangeNotifier, notify_quietly};
use super::{EngineError, EngineResult};
use crate::config::AssignmentConfig;
use crate::store::SharedStore;
use crate::tenant::TenantContext;

const DEFAULT_SKILL_ATTRIBUTE: &str = "skill_level";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentOutcome {
    pub lead_id: Uuid,
    pub rule_id: Uuid,
    pub member_id: Uuid,
    pub user_id: Uuid,
    pub method: AssignmentType,
}

/// Index after `last` in a list of `count` members. A negative cursor means
/// nothing has been assigned yet; a cursor beyond the list (members were
/// deactivated) is reduced modulo the current count first.
pub fn round_robin_index(last: i32, count: usize) -> usize {
    if count == 0 || last < 0 {
        return 0;
    }
    ((last as usize % count) + 1) % count
}

/// Lowest open-lead ratio wins; ties go to the member reached first in
/// rotation order starting from the round-robin position.
pub fn select_load_balanced(last: i32, members: &[AssignmentMember], open_counts: &HashMap<Uuid, i64>) -> usize {
    let count = members.len();
    let start = round_robin_index(last, count);
    let mut best = start;
    let mut best_ratio = f64::INFINITY;

    for offset in 0..count {
        let index = (start + offset) % count;
        let member = &members[index];
        let open = open_counts.get(&member.user_id).copied().unwrap_or(0) as f64;
        let ratio = open / f64::from(member.max_capacity.max(1));
        if ratio < best_ratio {
            best_ratio = ratio;
            best = index;
        }
    }

    best
}

/// Round-robin over the members whose skill level matches `skill`, keeping the
/// cursor as an index into the full list. Falls back to plain round-robin when
/// nobody matches or the lead has no value for the attribute.
pub fn select_skill_based(last: i32, members: &[AssignmentMember], skill: Option<&str>) -> usize {
    let count = members.len();
    let start = round_robin_index(last, count);
    let Some(skill) = skill.map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()) else {
        return start;
    };

    (0..count)
        .map(|offset| (start + offset) % count)
        .find(|&index| {
            members[index]
                .skill_level
                .as_deref()
                .is_some_and(|level| level.trim().to_lowercase() == skill)
        })
        .unwrap_or(start)
}

fn lead_skill(rule: &AssignmentRule, snapshot: &serde_json::Value) -> Option<String> {
    let attribute = rule.skill_attribute.as_deref().unwrap_or(DEFAULT_SKILL_ATTRIBUTE);
    match field_value(snapshot, attribute)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponential = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    let jitter = if base_ms > 0 { rand::thread_rng().gen_range(0..=base_ms) } else { 0 };
    Duration::from_millis(exponential.saturating_add(jitter))
}

pub struct AssignmentEngine {
    store: SharedStore,
    notifier: Arc<dyn ChangeNotifier>,
    config: AssignmentConfig,
}

impl AssignmentEngine {
    pub fn new(store: SharedStore, notifier: Arc<dyn ChangeNotifier>, config: AssignmentConfig) -> Self {
        Self { store, notifier, config }
    }

    /// Picks an owner for `lead` from the first matching rule (priority order)
    /// that has active members. `None` leaves the lead unassigned.
    pub async fn assign(&self, ctx: &TenantContext, lead: &Lead) -> EngineResult<Option<AssignmentOutcome>> {
        let mut rules = self.store.list_active_assignment_rules(ctx).await?;
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));

        let snapshot = lead.to_snapshot();

        for rule in &rules {
            if !Self::criteria_match(rule, &snapshot) {
                continue;
            }

            let Some(outcome) = self.assign_with_rule(ctx, lead.id, rule.id, &snapshot).await? else {
                debug!(rule_id = %rule.id, "Assignment rule has no active members, trying next");
                continue;
            };

            self.store.set_owner(ctx, lead.id, Some(outcome.user_id)).await?;

            info!(
                lead_id = %lead.id,
                rule_id = %outcome.rule_id,
                user_id = %outcome.user_id,
                method = outcome.method.as_str(),
                "Lead assigned"
            );

            notify_quietly(
                self.notifier.as_ref(),
                ChangeEvent::new(ctx.tenant_id, entity_types::LEAD, "assigned", lead.id)
                    .with_payload(serde_json::json!({ "assigned_to": outcome.user_id, "rule_id": outcome.rule_id })),
            )
            .await;

            return Ok(Some(outcome));
        }

        debug!(lead_id = %lead.id, rules = rules.len(), "No assignment rule matched");
        Ok(None)
    }

    fn criteria_match(rule: &AssignmentRule, snapshot: &serde_json::Value) -> bool {
        let criteria = match &rule.criteria {
            None | Some(serde_json::Value::Null) => return true,
            Some(serde_json::Value::Object(map)) if map.is_empty() => return true,
            Some(criteria) => criteria,
        };

        match ConditionSet::from_value(criteria) {
            Ok(conditions) => conditions.evaluate(snapshot),
            Err(e) => {
                warn!(rule_id = %rule.id, rule = %rule.name, error = %e, "Skipping assignment rule");
                false
            }
        }
    }

    /// Selects a member and advances the rule's cursor. Every attempt re-reads
    /// the rule and its members; a lost compare-and-swap backs off and retries.
    async fn assign_with_rule(
        &self,
        ctx: &TenantContext,
        lead_id: Uuid,
        rule_id: Uuid,
        snapshot: &serde_json::Value,
    ) -> EngineResult<Option<AssignmentOutcome>> {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let Some(rule) = self.store.get_assignment_rule(ctx, rule_id).await? else {
                return Ok(None);
            };
            if !rule.is_active {
                return Ok(None);
            }

            let members = self.store.list_members(ctx, rule_id, true).await?;
            if members.is_empty() {
                return Ok(None);
            }

            let index = self.select(ctx, &rule, &members, snapshot).await?;

            if self
                .store
                .update_cursor(ctx, rule.id, rule.version, index as i32)
                .await?
            {
                let member = &members[index];
                return Ok(Some(AssignmentOutcome {
                    lead_id,
                    rule_id: rule.id,
                    member_id: member.id,
                    user_id: member.user_id,
                    method: rule.assignment_type,
                }));
            }

            debug!(rule_id = %rule.id, attempt, "Rotation cursor changed concurrently");
            if attempt < max_attempts {
                let delay = backoff_delay(self.config.backoff_base_ms, attempt);
                tokio::time::sleep(delay).await;
            }
        }

        warn!(rule_id = %rule_id, attempts = max_attempts, "Giving up on assignment after repeated cursor conflicts");
        Err(EngineError::ConcurrencyConflict { attempts: max_attempts })
    }

    async fn select(
        &self,
        ctx: &TenantContext,
        rule: &AssignmentRule,
        members: &[AssignmentMember],
        snapshot: &serde_json::Value,
    ) -> EngineResult<usize> {
        let index = match rule.assignment_type {
            AssignmentType::RoundRobin => round_robin_index(rule.last_assigned_index, members.len()),
            AssignmentType::LoadBalanced => {
                let owners: Vec<Uuid> = members.iter().map(|m| m.user_id).collect();
                let open_counts = self.store.count_open_leads(ctx, &owners).await?;
                select_load_balanced(rule.last_assigned_index, members, &open_counts)
            }
            AssignmentType::SkillBased => {
                let skill = lead_skill(rule, snapshot);
                select_skill_based(rule.last_assigned_index, members, skill.as_deref())
            }
        };
        Ok(index)
    }

    /// Owner override from a user; bypasses rules and leaves every cursor untouched.
    pub async fn assign_manually(&self, ctx: &TenantContext, lead_id: Uuid, user_id: Option<Uuid>) -> EngineResult<Lead> {
        self.store
            .get_lead(ctx, lead_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Lead {}", lead_id)))?;

        self.store.set_owner(ctx, lead_id, user_id).await?;

        info!(lead_id = %lead_id, user_id = ?user_id, actor = ?ctx.actor_id, "Lead owner set manually");

        notify_quietly(
            self.notifier.as_ref(),
            ChangeEvent::new(ctx.tenant_id, entity_types::LEAD, "assigned", lead_id)
                .with_payload(serde_json::json!({ "assigned_to": user_id, "manual": true })),
        )
        .await;

        self.store
            .get_lead(ctx, lead_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Lead {}", lead_id)))
    }
}
