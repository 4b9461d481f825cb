use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use leadflow_shared::{Lead, MergeHistoryEntry, entity_types};

use super::notifier::{ChangeEvent, ChangeNotifier, notify_quietly};
use super::{EngineError, EngineResult};
use crate::store::{MergePlan, SharedStore};
use crate::tenant::TenantContext;

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

fn backfill(target: &mut Option<String>, source: &Option<String>) {
    if is_blank(target) && !is_blank(source) {
        *target = source.clone();
    }
}

/// Fills empty survivor fields from the losers, first non-empty value wins.
/// Non-empty survivor values are never replaced.
pub fn reconcile(survivor: &Lead, losers: &[Lead]) -> Lead {
    let mut merged = survivor.clone();

    for loser in losers {
        if merged.first_name.trim().is_empty() && !loser.first_name.trim().is_empty() {
            merged.first_name = loser.first_name.clone();
        }
        if merged.last_name.trim().is_empty() && !loser.last_name.trim().is_empty() {
            merged.last_name = loser.last_name.clone();
        }

        backfill(&mut merged.email, &loser.email);
        backfill(&mut merged.phone, &loser.phone);
        backfill(&mut merged.company_name, &loser.company_name);
        backfill(&mut merged.job_title, &loser.job_title);
        backfill(&mut merged.source, &loser.source);
        backfill(&mut merged.address, &loser.address);
        backfill(&mut merged.city, &loser.city);
        backfill(&mut merged.state, &loser.state);
        backfill(&mut merged.country, &loser.country);
        backfill(&mut merged.postal_code, &loser.postal_code);
        backfill(&mut merged.notes, &loser.notes);

        if merged.estimated_value.is_none() {
            merged.estimated_value = loser.estimated_value;
        }
        if merged.assigned_to.is_none() {
            merged.assigned_to = loser.assigned_to;
        }

        if let (Some(target), Some(source)) = (merged.attributes.as_object_mut(), loser.attributes.as_object()) {
            for (key, value) in source {
                let missing = target.get(key).is_none_or(|v| v.is_null() || v.as_str().is_some_and(str::is_empty));
                if missing && !value.is_null() {
                    target.insert(key.clone(), value.clone());
                }
            }
        } else if merged.attributes.is_null() && loser.attributes.is_object() {
            merged.attributes = loser.attributes.clone();
        }
    }

    merged
}

pub struct MergeService {
    store: SharedStore,
    notifier: Arc<dyn ChangeNotifier>,
}

impl MergeService {
    pub fn new(store: SharedStore, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Folds `duplicate_ids` into `survivor_id`. Input is validated before
    /// anything is written; the store applies the plan atomically.
    pub async fn merge(&self, ctx: &TenantContext, survivor_id: Uuid, duplicate_ids: &[Uuid]) -> EngineResult<Lead> {
        if duplicate_ids.is_empty() {
            return Err(EngineError::DataIntegrity("no duplicates given to merge".to_string()));
        }
        if duplicate_ids.contains(&survivor_id) {
            return Err(EngineError::DataIntegrity(
                "survivor cannot be merged into itself".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(duplicate_ids.len());
        if let Some(repeated) = duplicate_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(EngineError::DataIntegrity(format!("lead {} listed more than once", repeated)));
        }

        let survivor = self
            .store
            .get_lead(ctx, survivor_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Lead {}", survivor_id)))?;

        let mut losers = Vec::with_capacity(duplicate_ids.len());
        for id in duplicate_ids {
            let lead = self
                .store
                .get_lead(ctx, *id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("Lead {}", id)))?;
            losers.push(lead);
        }

        let snapshot = serde_json::to_value(&losers).map_err(crate::store::StoreError::from)?;

        let plan = MergePlan {
            survivor: reconcile(&survivor, &losers),
            loser_ids: duplicate_ids.to_vec(),
            history: MergeHistoryEntry {
                id: Uuid::new_v4(),
                tenant_id: ctx.tenant_id,
                survivor_id,
                merged_lead_ids: duplicate_ids.to_vec(),
                snapshot,
                merged_by: ctx.actor_id,
                merged_at: Utc::now(),
            },
        };

        self.store.apply_merge(ctx, &plan).await?;

        info!(
            survivor_id = %survivor_id,
            merged = duplicate_ids.len(),
            actor = ?ctx.actor_id,
            "Leads merged"
        );

        notify_quietly(
            self.notifier.as_ref(),
            ChangeEvent::new(ctx.tenant_id, entity_types::LEAD, "merged", survivor_id)
                .with_payload(serde_json::json!({ "merged_lead_ids": duplicate_ids })),
        )
        .await;
        for id in duplicate_ids {
            notify_quietly(
                self.notifier.as_ref(),
                ChangeEvent::new(ctx.tenant_id, entity_types::LEAD, "deleted", *id),
            )
            .await;
        }

        self.store
            .get_lead(ctx, survivor_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Lead {}", survivor_id)))
    }

    pub async fn history(&self, ctx: &TenantContext, survivor_id: Uuid) -> EngineResult<Vec<MergeHistoryEntry>> {
        Ok(self.store.list_merge_history(ctx, survivor_id).await?)
    }
}
