//! Opportunistic duplicate detection.
//!
//! Runs against one triggering lead at a time: the store narrows the tenant's
//! leads to those sharing an email, phone or company, and each candidate is
//! scored here. Nothing scans all pairs.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use leadflow_shared::{DuplicateStatus, Lead, LeadDuplicate, MatchType, entity_types};

use super::notifier::{ChangeEvent, ChangeNotifier, notify_quietly};
use super::{EngineError, EngineResult};
use crate::config::DuplicateConfig;
use crate::store::{SharedStore, normalize_company, normalize_email, normalize_phone, normalize_text};
use crate::tenant::TenantContext;

pub const EMAIL_WEIGHT: i32 = 70;
pub const PHONE_WEIGHT: i32 = 40;
pub const FUZZY_NAME_WEIGHT: i32 = 30;
pub const MAX_CONFIDENCE: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchScore {
    pub confidence: i32,
    pub match_type: MatchType,
}

fn names_match(a: &Lead, b: &Lead, max_distance: usize) -> bool {
    let left = normalize_text(&a.full_name());
    let right = normalize_text(&b.full_name());
    if left.is_empty() || right.is_empty() {
        return false;
    }
    left == right || strsim::levenshtein(&left, &right) <= max_distance
}

/// Confidence that `a` and `b` are the same person, or `None` if no pass fired.
/// The match type is the pass with the largest weight.
pub fn score_pair(a: &Lead, b: &Lead, max_distance: usize) -> Option<MatchScore> {
    let mut passes: Vec<(i32, MatchType)> = Vec::with_capacity(3);

    let email = normalize_email(a.email.as_deref());
    if email.is_some() && email == normalize_email(b.email.as_deref()) {
        passes.push((EMAIL_WEIGHT, MatchType::Email));
    }

    let phone = normalize_phone(a.phone.as_deref());
    if phone.is_some() && phone == normalize_phone(b.phone.as_deref()) {
        passes.push((PHONE_WEIGHT, MatchType::NamePhone));
    }

    let company = normalize_company(a.company_name.as_deref());
    if company.is_some()
        && company == normalize_company(b.company_name.as_deref())
        && names_match(a, b, max_distance)
    {
        passes.push((FUZZY_NAME_WEIGHT, MatchType::Fuzzy));
    }

    let (_, match_type) = passes.iter().copied().max_by_key(|(weight, _)| *weight)?;
    let confidence = passes.iter().map(|(weight, _)| weight).sum::<i32>().min(MAX_CONFIDENCE);

    Some(MatchScore { confidence, match_type })
}

pub struct DuplicateDetector {
    store: SharedStore,
    notifier: Arc<dyn ChangeNotifier>,
    config: DuplicateConfig,
}

impl DuplicateDetector {
    pub fn new(store: SharedStore, notifier: Arc<dyn ChangeNotifier>, config: DuplicateConfig) -> Self {
        Self { store, notifier, config }
    }

    /// Compares `lead` with existing leads and records every pair at or above
    /// the confidence floor. Pairs already on file are returned as stored,
    /// whatever their status.
    pub async fn find_duplicates(&self, ctx: &TenantContext, lead: &Lead) -> EngineResult<Vec<LeadDuplicate>> {
        let candidates = self.store.find_duplicate_candidates(ctx, lead).await?;
        let mut found = Vec::new();
        let mut created = 0;

        for candidate in &candidates {
            let Some(score) = score_pair(lead, candidate, self.config.name_max_distance) else {
                continue;
            };
            if score.confidence < self.config.confidence_floor {
                continue;
            }

            if let Some(existing) = self.store.find_duplicate_pair(ctx, lead.id, candidate.id).await? {
                found.push(existing);
                continue;
            }

            let duplicate =
                LeadDuplicate::between(ctx.tenant_id, lead.id, candidate.id, score.match_type, score.confidence);

            if self.store.insert_duplicate(ctx, &duplicate).await? {
                created += 1;
                found.push(duplicate);
            } else if let Some(existing) = self.store.find_duplicate_pair(ctx, lead.id, candidate.id).await? {
                // inserted concurrently by another trigger
                found.push(existing);
            }
        }

        debug!(lead_id = %lead.id, candidates = candidates.len(), created, "Duplicate scan complete");

        if created > 0 {
            info!(lead_id = %lead.id, created, "Duplicate suggestions recorded");
            notify_quietly(
                self.notifier.as_ref(),
                ChangeEvent::new(ctx.tenant_id, entity_types::LEAD, "duplicates_found", lead.id)
                    .with_payload(serde_json::json!({ "count": created })),
            )
            .await;
        }

        Ok(found)
    }

    pub async fn list_suggestions(
        &self,
        ctx: &TenantContext,
        status: Option<DuplicateStatus>,
    ) -> EngineResult<Vec<LeadDuplicate>> {
        Ok(self.store.list_duplicates(ctx, status).await?)
    }

    /// Human resolution of a pending suggestion.
    pub async fn resolve(
        &self,
        ctx: &TenantContext,
        duplicate_id: Uuid,
        status: DuplicateStatus,
    ) -> EngineResult<LeadDuplicate> {
        if status == DuplicateStatus::Pending {
            return Err(EngineError::DataIntegrity(
                "a suggestion can only be resolved as confirmed or dismissed".to_string(),
            ));
        }

        let existing = self
            .store
            .get_duplicate(ctx, duplicate_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Duplicate suggestion {}", duplicate_id)))?;

        if existing.status != DuplicateStatus::Pending {
            return Err(EngineError::DataIntegrity(format!(
                "duplicate suggestion {} is already resolved",
                duplicate_id
            )));
        }

        let resolved = self
            .store
            .resolve_duplicate(ctx, duplicate_id, status)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Duplicate suggestion {}", duplicate_id)))?;

        info!(duplicate_id = %duplicate_id, status = ?status, actor = ?ctx.actor_id, "Duplicate suggestion resolved");
        Ok(resolved)
    }
}
