// Scoring engine against the in-memory store

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use leadflow_shared::ScoreHistoryEntry;

use crate::automation::EngineError;
use crate::store::ScoringStore;
use crate::tests::fixtures;
use crate::tests::helpers::{init_tracing, memory_store, reload, scoring_engine, seed_lead, tenant};

#[tokio::test]
async fn test_scoring_twice_counts_twice() {
    init_tracing();
    let store = memory_store();
    let ctx = tenant();
    let engine = scoring_engine(&store);

    let rule = fixtures::scoring_rule(
        ctx.tenant_id,
        "profile",
        fixtures::condition("has_email", "equals", json!(true)),
        10,
    );
    store.insert_scoring_rule(&ctx, &rule).await.unwrap();
    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    assert_eq!(engine.apply_rules_on_event(&ctx, &lead, None).await.unwrap(), 10);
    let lead = reload(&store, &ctx, lead.id).await;
    assert_eq!(lead.score, 10);

    // one call per state transition; a repeated call is a second transition
    assert_eq!(engine.apply_rules_on_event(&ctx, &lead, None).await.unwrap(), 20);

    let history = store.list_score_history(&ctx, lead.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].previous_score, 10);
    assert_eq!(history[1].new_score, 20);
    assert_eq!(history[1].rule_id, Some(rule.id));
}

#[tokio::test]
async fn test_category_filter() {
    let store = memory_store();
    let ctx = tenant();
    let engine = scoring_engine(&store);

    let always = fixtures::condition("source", "equals", json!("web"));
    store
        .insert_scoring_rule(&ctx, &fixtures::scoring_rule(ctx.tenant_id, "profile", always.clone(), 10))
        .await
        .unwrap();
    store
        .insert_scoring_rule(&ctx, &fixtures::scoring_rule(ctx.tenant_id, "engagement", always, 5))
        .await
        .unwrap();
    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    let score = engine.apply_rules_on_event(&ctx, &lead, Some("engagement")).await.unwrap();

    assert_eq!(score, 5);
    assert_eq!(store.list_score_history(&ctx, lead.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_rule_is_skipped() {
    let store = memory_store();
    let ctx = tenant();
    let engine = scoring_engine(&store);

    // written straight to storage, past save-time validation
    let broken = fixtures::scoring_rule(ctx.tenant_id, "profile", json!({ "when": "always" }), 50);
    let valid = fixtures::scoring_rule(
        ctx.tenant_id,
        "profile",
        fixtures::condition("source", "equals", json!("WEB")),
        7,
    );
    store.insert_scoring_rule(&ctx, &broken).await.unwrap();
    store.insert_scoring_rule(&ctx, &valid).await.unwrap();
    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    assert_eq!(engine.apply_rules_on_event(&ctx, &lead, None).await.unwrap(), 7);
}

#[tokio::test]
async fn test_non_matching_rules_leave_score_alone() {
    let store = memory_store();
    let ctx = tenant();
    let engine = scoring_engine(&store);

    let rule = fixtures::scoring_rule(
        ctx.tenant_id,
        "profile",
        fixtures::condition("estimated_value", "gt", json!(100000)),
        25,
    );
    store.insert_scoring_rule(&ctx, &rule).await.unwrap();
    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    assert_eq!(engine.apply_rules_on_event(&ctx, &lead, None).await.unwrap(), 0);
    assert!(store.list_score_history(&ctx, lead.id).await.unwrap().is_empty());
}

fn history_entry(lead_id: Uuid, tenant_id: Uuid, delta: i32, decay_days: Option<i32>, age: Duration) -> ScoreHistoryEntry {
    ScoreHistoryEntry {
        id: Uuid::new_v4(),
        tenant_id,
        lead_id,
        rule_id: Some(Uuid::new_v4()),
        previous_score: 0,
        new_score: delta.max(0),
        score_delta: delta,
        decay_days,
        reason: "seeded".to_string(),
        created_at: Utc::now() - age,
    }
}

#[tokio::test]
async fn test_recalculation_applies_decay() {
    let store = memory_store();
    let ctx = tenant();
    let engine = scoring_engine(&store);
    let now = Utc::now();

    let mut lead = fixtures::lead(ctx.tenant_id);
    lead.score = 30;
    let lead = seed_lead(&store, &ctx, lead).await;

    let mut decaying = history_entry(lead.id, ctx.tenant_id, 10, Some(30), Duration::zero());
    decaying.created_at = now - Duration::days(15);
    let mut expired = history_entry(lead.id, ctx.tenant_id, 10, Some(7), Duration::zero());
    expired.created_at = now - Duration::days(40);
    let mut permanent = history_entry(lead.id, ctx.tenant_id, 10, None, Duration::zero());
    permanent.created_at = now - Duration::days(400);
    for entry in [&decaying, &expired, &permanent] {
        store.append_score_history(&ctx, entry).await.unwrap();
    }

    assert_eq!(engine.current_score(&ctx, lead.id, now).await.unwrap(), 15);

    let summary = engine.recalculate_scores(&ctx, now).await.unwrap();
    assert_eq!(summary.leads_checked, 1);
    assert_eq!(summary.leads_updated, 1);
    assert_eq!(reload(&store, &ctx, lead.id).await.score, 15);

    let breakdown = engine.score_breakdown(&ctx, lead.id, now).await.unwrap();
    assert_eq!(breakdown.current_score, 15);
    assert_eq!(breakdown.contributions.len(), 3);
    assert_eq!(breakdown.contributions.iter().filter(|c| c.expired).count(), 1);

    // a second pass has nothing left to change
    let again = engine.recalculate_scores(&ctx, now).await.unwrap();
    assert_eq!(again.leads_updated, 0);
}

#[tokio::test]
async fn test_new_points_stack_on_decayed_total() {
    let store = memory_store();
    let ctx = tenant();
    let engine = scoring_engine(&store);
    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    let mut old = history_entry(lead.id, ctx.tenant_id, 20, Some(10), Duration::zero());
    old.created_at = Utc::now() - Duration::days(5);
    store.append_score_history(&ctx, &old).await.unwrap();

    let rule = fixtures::scoring_rule(
        ctx.tenant_id,
        "engagement",
        fixtures::condition("source", "equals", json!("web")),
        5,
    );
    store.insert_scoring_rule(&ctx, &rule).await.unwrap();

    // 20 decayed to ~10, plus 5
    assert_eq!(engine.apply_rules_on_event(&ctx, &lead, None).await.unwrap(), 15);
}

#[tokio::test]
async fn test_manual_adjustment_is_floored_and_permanent() {
    let store = memory_store();
    let ctx = tenant();
    let engine = scoring_engine(&store);
    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    assert_eq!(engine.adjust_score(&ctx, lead.id, 12, "met at conference").await.unwrap(), 12);
    assert_eq!(engine.adjust_score(&ctx, lead.id, -50, "bounced email").await.unwrap(), 0);

    let history = store.list_score_history(&ctx, lead.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|e| e.rule_id.is_none() && e.decay_days.is_none()));
    assert_eq!(history[0].reason, "met at conference");
    assert_eq!(reload(&store, &ctx, lead.id).await.score, 0);
}

#[tokio::test]
async fn test_zero_adjustment_rejected() {
    let store = memory_store();
    let ctx = tenant();
    let engine = scoring_engine(&store);
    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    let result = engine.adjust_score(&ctx, lead.id, 0, "nothing").await;
    assert!(matches!(result, Err(EngineError::Configuration(_))));
}

#[tokio::test]
async fn test_scoring_is_tenant_scoped() {
    let store = memory_store();
    let ctx = tenant();
    let other = tenant();
    let engine = scoring_engine(&store);

    let rule = fixtures::scoring_rule(
        other.tenant_id,
        "profile",
        fixtures::condition("source", "equals", json!("web")),
        40,
    );
    store.insert_scoring_rule(&other, &rule).await.unwrap();
    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    assert_eq!(engine.apply_rules_on_event(&ctx, &lead, None).await.unwrap(), 0);
    assert!(matches!(
        engine.score_breakdown(&other, lead.id, Utc::now()).await,
        Err(EngineError::NotFound(_))
    ));
}
