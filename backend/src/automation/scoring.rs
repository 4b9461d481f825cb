//! Lead scoring.
//!
//! Every matching rule appends one immutable history entry. The lead's score is
//! a projection over that history: entries with `decay_days` lose value linearly
//! and contribute nothing once they are `decay_days` old. Nothing in history is
//! ever rewritten, so the projection can be recomputed at any time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use leadflow_shared::{Lead, ScoreHistoryEntry, ScoringRule, entity_types};

use super::conditions::ConditionSet;
use super::notifier::{ChangeEvent, ChangeNotifier, notify_quietly};
use super::{EngineError, EngineResult};
use crate::store::SharedStore;
use crate::tenant::TenantContext;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Value of one history entry at `now`.
pub fn decayed_contribution(delta: i32, decay_days: Option<i32>, recorded_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let delta = f64::from(delta);
    let Some(days) = decay_days.filter(|d| *d > 0) else {
        return delta;
    };

    let age_days = (now - recorded_at).num_seconds().max(0) as f64 / SECONDS_PER_DAY;
    let remaining = 1.0 - age_days / f64::from(days);
    if remaining <= 0.0 { 0.0 } else { delta * remaining }
}

fn clamp_score(raw: f64) -> i32 {
    raw.round().clamp(0.0, f64::from(i32::MAX)) as i32
}

/// Sum of decay-adjusted contributions, rounded and floored at zero.
pub fn project_score(history: &[ScoreHistoryEntry], now: DateTime<Utc>) -> i32 {
    clamp_score(raw_total(history, now))
}

fn raw_total(history: &[ScoreHistoryEntry], now: DateTime<Utc>) -> f64 {
    history
        .iter()
        .map(|e| decayed_contribution(e.score_delta, e.decay_days, e.created_at, now))
        .sum()
}

/// Active rules in evaluation order: `sort_order` ascending, unset last, ties by id
pub fn order_rules(rules: &mut [ScoringRule]) {
    rules.sort_by(|a, b| {
        a.sort_order
            .unwrap_or(i32::MAX)
            .cmp(&b.sort_order.unwrap_or(i32::MAX))
            .then(a.id.cmp(&b.id))
    });
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreContribution {
    pub entry: ScoreHistoryEntry,
    pub current_value: f64,
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub lead_id: Uuid,
    pub stored_score: i32,
    pub current_score: i32,
    pub as_of: DateTime<Utc>,
    pub contributions: Vec<ScoreContribution>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecalculationSummary {
    pub leads_checked: usize,
    pub leads_updated: usize,
}

pub struct ScoringEngine {
    store: SharedStore,
    notifier: Arc<dyn ChangeNotifier>,
}

impl ScoringEngine {
    pub fn new(store: SharedStore, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Evaluates active rules (optionally one category) against `lead` and records
    /// one history entry per match. Not idempotent: callers invoke it once per
    /// state transition.
    pub async fn apply_rules_on_event(
        &self,
        ctx: &TenantContext,
        lead: &Lead,
        category: Option<&str>,
    ) -> EngineResult<i32> {
        self.apply_rules_at(ctx, lead, category, Utc::now()).await
    }

    pub(crate) async fn apply_rules_at(
        &self,
        ctx: &TenantContext,
        lead: &Lead,
        category: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<i32> {
        let mut rules = self.store.list_active_scoring_rules(ctx, category).await?;
        order_rules(&mut rules);

        let history = self.store.list_score_history(ctx, lead.id).await?;
        let mut raw = raw_total(&history, now);
        let snapshot = lead.to_snapshot();
        let mut applied = 0;

        for rule in &rules {
            let conditions = match ConditionSet::from_value(&rule.condition) {
                Ok(c) => c,
                Err(e) => {
                    warn!(rule_id = %rule.id, rule = %rule.name, error = %e, "Skipping scoring rule");
                    continue;
                }
            };

            if !conditions.evaluate(&snapshot) {
                continue;
            }

            let previous_score = clamp_score(raw);
            raw += f64::from(rule.score_delta);

            let entry = ScoreHistoryEntry {
                id: Uuid::new_v4(),
                tenant_id: ctx.tenant_id,
                lead_id: lead.id,
                rule_id: Some(rule.id),
                previous_score,
                new_score: clamp_score(raw),
                score_delta: rule.score_delta,
                decay_days: rule.decay_days,
                reason: format!("Rule '{}' matched", rule.name),
                created_at: now,
            };
            self.store.append_score_history(ctx, &entry).await?;
            applied += 1;
        }

        let score = clamp_score(raw);
        self.store.set_score(ctx, lead.id, score).await?;

        debug!(lead_id = %lead.id, rules = rules.len(), applied, score, "Scoring pass complete");

        if applied > 0 {
            notify_quietly(
                self.notifier.as_ref(),
                ChangeEvent::new(ctx.tenant_id, entity_types::LEAD, "score_updated", lead.id)
                    .with_payload(serde_json::json!({ "score": score })),
            )
            .await;
        }

        Ok(score)
    }

    /// Manual adjustment; recorded without a rule reference and never decays.
    pub async fn adjust_score(
        &self,
        ctx: &TenantContext,
        lead_id: Uuid,
        delta: i32,
        reason: &str,
    ) -> EngineResult<i32> {
        if delta == 0 {
            return Err(EngineError::Configuration("score adjustment must not be zero".to_string()));
        }

        self.store
            .get_lead(ctx, lead_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Lead {}", lead_id)))?;

        let now = Utc::now();
        let history = self.store.list_score_history(ctx, lead_id).await?;
        let raw = raw_total(&history, now);
        let score = clamp_score(raw + f64::from(delta));

        let entry = ScoreHistoryEntry {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            lead_id,
            rule_id: None,
            previous_score: clamp_score(raw),
            new_score: score,
            score_delta: delta,
            decay_days: None,
            reason: reason.trim().to_string(),
            created_at: now,
        };
        self.store.append_score_history(ctx, &entry).await?;
        self.store.set_score(ctx, lead_id, score).await?;

        info!(lead_id = %lead_id, delta, score, actor = ?ctx.actor_id, "Manual score adjustment");
        Ok(score)
    }

    pub async fn current_score(&self, ctx: &TenantContext, lead_id: Uuid, now: DateTime<Utc>) -> EngineResult<i32> {
        let history = self.store.list_score_history(ctx, lead_id).await?;
        Ok(project_score(&history, now))
    }

    pub async fn score_breakdown(
        &self,
        ctx: &TenantContext,
        lead_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<ScoreBreakdown> {
        let lead = self
            .store
            .get_lead(ctx, lead_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Lead {}", lead_id)))?;
        let history = self.store.list_score_history(ctx, lead_id).await?;

        let current_score = project_score(&history, now);
        let contributions = history
            .into_iter()
            .map(|entry| {
                let current_value = decayed_contribution(entry.score_delta, entry.decay_days, entry.created_at, now);
                let expired = entry.decay_days.is_some() && current_value == 0.0;
                ScoreContribution {
                    entry,
                    current_value,
                    expired,
                }
            })
            .collect();

        Ok(ScoreBreakdown {
            lead_id,
            stored_score: lead.score,
            current_score,
            as_of: now,
            contributions,
        })
    }

    /// Re-projects every open lead so decayed points leave `lead.score`.
    pub async fn recalculate_scores(&self, ctx: &TenantContext, now: DateTime<Utc>) -> EngineResult<RecalculationSummary> {
        let lead_ids = self.store.list_scorable_leads(ctx).await?;
        let mut summary = RecalculationSummary::default();

        for lead_id in lead_ids {
            let Some(lead) = self.store.get_lead(ctx, lead_id).await? else {
                continue;
            };
            summary.leads_checked += 1;

            let history = self.store.list_score_history(ctx, lead_id).await?;
            let projected = project_score(&history, now);
            if projected != lead.score {
                self.store.set_score(ctx, lead_id, projected).await?;
                summary.leads_updated += 1;
            }
        }

        info!(
            tenant_id = %ctx.tenant_id,
            checked = summary.leads_checked,
            updated = summary.leads_updated,
            "Score recalculation complete"
        );
        Ok(summary)
    }
}
