// Assignment engine: rotation fairness, cursor handling and strategy selection

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use leadflow_shared::{AssignmentMember, AssignmentType, LeadStatus};

use crate::automation::AssignmentEngine;
use crate::automation::notifier::MockChangeNotifier;
use crate::store::{AssignmentStore, LeadStore, SharedStore};
use crate::tenant::TenantContext;
use crate::tests::fixtures;
use crate::tests::helpers::{assignment_engine, init_tracing, memory_store, reload, seed_lead, tenant, test_config};

async fn rule_with_members(
    store: &SharedStore,
    ctx: &TenantContext,
    assignment_type: AssignmentType,
    members: usize,
) -> (Uuid, Vec<AssignmentMember>) {
    let rule = fixtures::assignment_rule(ctx.tenant_id, assignment_type);
    store.insert_assignment_rule(ctx, &rule).await.unwrap();

    let mut inserted = Vec::new();
    for _ in 0..members {
        let member = fixtures::member(ctx.tenant_id, rule.id, 10, None);
        inserted.push(store.insert_member(ctx, &member).await.unwrap());
    }
    (rule.id, inserted)
}

#[tokio::test]
async fn test_round_robin_is_fair() {
    init_tracing();
    let store = memory_store();
    let ctx = tenant();
    let engine = assignment_engine(&store);
    let (_, members) = rule_with_members(&store, &ctx, AssignmentType::RoundRobin, 3).await;

    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for _ in 0..10 {
        let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
        let outcome = engine.assign(&ctx, &lead).await.unwrap().expect("lead should be assigned");
        *counts.entry(outcome.user_id).or_default() += 1;
        assert_eq!(reload(&store, &ctx, lead.id).await.assigned_to, Some(outcome.user_id));
    }

    for member in &members {
        let n = counts.get(&member.user_id).copied().unwrap_or(0);
        assert!((3..=4).contains(&n), "member got {} of 10 leads", n);
    }
}

#[tokio::test]
async fn test_round_robin_follows_member_order() {
    let store = memory_store();
    let ctx = tenant();
    let engine = assignment_engine(&store);
    let (_, members) = rule_with_members(&store, &ctx, AssignmentType::RoundRobin, 3).await;

    let mut picked = Vec::new();
    for _ in 0..4 {
        let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
        picked.push(engine.assign(&ctx, &lead).await.unwrap().unwrap().user_id);
    }

    let expected: Vec<Uuid> = [0, 1, 2, 0].iter().map(|i| members[*i].user_id).collect();
    assert_eq!(picked, expected);
}

#[tokio::test]
async fn test_cursor_wraps_to_first_member() {
    let store = memory_store();
    let ctx = tenant();
    let engine = assignment_engine(&store);
    let (rule_id, members) = rule_with_members(&store, &ctx, AssignmentType::RoundRobin, 3).await;
    assert!(store.update_cursor(&ctx, rule_id, 0, 2).await.unwrap());

    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let outcome = engine.assign(&ctx, &lead).await.unwrap().unwrap();

    assert_eq!(outcome.user_id, members[0].user_id);
    let rule = store.get_assignment_rule(&ctx, rule_id).await.unwrap().unwrap();
    assert_eq!(rule.last_assigned_index, 0);
    assert_eq!(rule.version, 2);
}

#[tokio::test]
async fn test_deactivated_member_leaves_rotation() {
    let store = memory_store();
    let ctx = tenant();
    let engine = assignment_engine(&store);
    let (_, members) = rule_with_members(&store, &ctx, AssignmentType::RoundRobin, 3).await;

    let first = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    assert_eq!(engine.assign(&ctx, &first).await.unwrap().unwrap().user_id, members[0].user_id);

    store.set_member_active(&ctx, members[1].id, false).await.unwrap();

    let mut picked = Vec::new();
    for _ in 0..3 {
        let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
        picked.push(engine.assign(&ctx, &lead).await.unwrap().unwrap().user_id);
    }

    assert!(!picked.contains(&members[1].user_id));
    assert_eq!(picked, vec![members[2].user_id, members[0].user_id, members[2].user_id]);
}

#[tokio::test]
async fn test_load_balanced_picks_lowest_ratio() {
    let store = memory_store();
    let ctx = tenant();
    let engine = assignment_engine(&store);

    let rule = fixtures::assignment_rule(ctx.tenant_id, AssignmentType::LoadBalanced);
    store.insert_assignment_rule(&ctx, &rule).await.unwrap();
    let busy = store
        .insert_member(&ctx, &fixtures::member(ctx.tenant_id, rule.id, 10, None))
        .await
        .unwrap();
    let idle = store
        .insert_member(&ctx, &fixtures::member(ctx.tenant_id, rule.id, 10, None))
        .await
        .unwrap();

    for owner in [busy.user_id, busy.user_id, busy.user_id, idle.user_id] {
        let mut lead = fixtures::lead(ctx.tenant_id);
        lead.assigned_to = Some(owner);
        seed_lead(&store, &ctx, lead).await;
    }
    // closed leads do not count towards load
    for _ in 0..5 {
        let mut lead = fixtures::lead(ctx.tenant_id);
        lead.assigned_to = Some(idle.user_id);
        lead.status = LeadStatus::Converted;
        seed_lead(&store, &ctx, lead).await;
    }

    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let outcome = engine.assign(&ctx, &lead).await.unwrap().unwrap();

    assert_eq!(outcome.user_id, idle.user_id);
    assert_eq!(outcome.method, AssignmentType::LoadBalanced);
}

#[tokio::test]
async fn test_skill_based_matches_lead_attribute() {
    let store = memory_store();
    let ctx = tenant();
    let engine = assignment_engine(&store);

    let mut rule = fixtures::assignment_rule(ctx.tenant_id, AssignmentType::SkillBased);
    rule.skill_attribute = Some("tier".to_string());
    store.insert_assignment_rule(&ctx, &rule).await.unwrap();
    let enterprise = store
        .insert_member(&ctx, &fixtures::member(ctx.tenant_id, rule.id, 10, Some("enterprise")))
        .await
        .unwrap();
    let smb = store
        .insert_member(&ctx, &fixtures::member(ctx.tenant_id, rule.id, 10, Some("smb")))
        .await
        .unwrap();

    let mut lead = fixtures::lead(ctx.tenant_id);
    lead.attributes = json!({ "tier": " SMB " });
    let lead = seed_lead(&store, &ctx, lead).await;
    assert_eq!(engine.assign(&ctx, &lead).await.unwrap().unwrap().user_id, smb.user_id);

    // nobody has the skill: plain rotation from the cursor
    let mut lead = fixtures::lead(ctx.tenant_id);
    lead.attributes = json!({ "tier": "government" });
    let lead = seed_lead(&store, &ctx, lead).await;
    let outcome = engine.assign(&ctx, &lead).await.unwrap().unwrap();
    assert!([enterprise.user_id, smb.user_id].contains(&outcome.user_id));
}

#[tokio::test]
async fn test_rules_tried_in_priority_order() {
    let store = memory_store();
    let ctx = tenant();
    let engine = assignment_engine(&store);

    let mut enterprise_rule = fixtures::assignment_rule(ctx.tenant_id, AssignmentType::RoundRobin);
    enterprise_rule.priority = 1;
    enterprise_rule.criteria = Some(fixtures::condition("estimated_value", "gt", json!(50000)));
    store.insert_assignment_rule(&ctx, &enterprise_rule).await.unwrap();
    let closer = store
        .insert_member(&ctx, &fixtures::member(ctx.tenant_id, enterprise_rule.id, 10, None))
        .await
        .unwrap();

    let mut empty_rule = fixtures::assignment_rule(ctx.tenant_id, AssignmentType::RoundRobin);
    empty_rule.priority = 2;
    store.insert_assignment_rule(&ctx, &empty_rule).await.unwrap();

    let mut catch_all = fixtures::assignment_rule(ctx.tenant_id, AssignmentType::RoundRobin);
    catch_all.priority = 3;
    store.insert_assignment_rule(&ctx, &catch_all).await.unwrap();
    let generalist = store
        .insert_member(&ctx, &fixtures::member(ctx.tenant_id, catch_all.id, 10, None))
        .await
        .unwrap();

    let mut big = fixtures::lead(ctx.tenant_id);
    big.estimated_value = Some(rust_decimal::Decimal::new(75000, 0));
    let big = seed_lead(&store, &ctx, big).await;
    let small = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    let outcome = engine.assign(&ctx, &big).await.unwrap().unwrap();
    assert_eq!((outcome.rule_id, outcome.user_id), (enterprise_rule.id, closer.user_id));

    // skips the non-matching rule and the rule without members
    let outcome = engine.assign(&ctx, &small).await.unwrap().unwrap();
    assert_eq!((outcome.rule_id, outcome.user_id), (catch_all.id, generalist.user_id));
}

#[tokio::test]
async fn test_no_members_leaves_lead_unassigned() {
    let store = memory_store();
    let ctx = tenant();
    let engine = assignment_engine(&store);
    rule_with_members(&store, &ctx, AssignmentType::RoundRobin, 0).await;

    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    assert!(engine.assign(&ctx, &lead).await.unwrap().is_none());
    assert!(reload(&store, &ctx, lead.id).await.assigned_to.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assignments_stay_fair() {
    let store = memory_store();
    let ctx = tenant();
    let engine = Arc::new(assignment_engine(&store));
    let (rule_id, members) = rule_with_members(&store, &ctx, AssignmentType::RoundRobin, 4).await;

    let mut leads = Vec::new();
    for _ in 0..20 {
        leads.push(seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await);
    }

    let handles: Vec<_> = leads
        .into_iter()
        .map(|lead| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.assign(&ctx, &lead).await })
        })
        .collect();

    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap().unwrap();
        *counts.entry(outcome.user_id).or_default() += 1;
    }

    // every successful compare-and-swap advanced the cursor exactly once
    for member in &members {
        assert_eq!(counts.get(&member.user_id), Some(&5));
    }
    let rule = store.get_assignment_rule(&ctx, rule_id).await.unwrap().unwrap();
    assert_eq!(rule.version, 20);
}

#[tokio::test]
async fn test_manual_assignment_keeps_cursor() {
    let store = memory_store();
    let ctx = tenant();
    let engine = assignment_engine(&store);
    let (rule_id, _) = rule_with_members(&store, &ctx, AssignmentType::RoundRobin, 2).await;

    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let owner = Uuid::new_v4();
    let updated = engine.assign_manually(&ctx, lead.id, Some(owner)).await.unwrap();

    assert_eq!(updated.assigned_to, Some(owner));
    let rule = store.get_assignment_rule(&ctx, rule_id).await.unwrap().unwrap();
    assert_eq!((rule.last_assigned_index, rule.version), (-1, 0));

    let cleared = engine.assign_manually(&ctx, lead.id, None).await.unwrap();
    assert!(cleared.assigned_to.is_none());
    assert!(store.get_lead(&ctx, lead.id).await.unwrap().unwrap().assigned_to.is_none());
}

#[tokio::test]
async fn test_assignment_survives_failing_notifier() {
    let store = memory_store();
    let ctx = tenant();
    let (_, members) = rule_with_members(&store, &ctx, AssignmentType::RoundRobin, 1).await;
    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    let mut notifier = MockChangeNotifier::new();
    let (lead_id, user_id) = (lead.id, members[0].user_id);
    notifier
        .expect_notify()
        .withf(move |event| {
            event.action == "assigned"
                && event.entity_id == lead_id
                && event.payload.as_ref().is_some_and(|p| p["assigned_to"] == json!(user_id))
        })
        .times(1)
        .returning(|_| Err(anyhow::anyhow!("broker down")));
    let engine = AssignmentEngine::new(store.clone(), Arc::new(notifier), test_config().assignment);

    let outcome = engine.assign(&ctx, &lead).await.unwrap().unwrap();

    assert_eq!(outcome.user_id, user_id);
    assert_eq!(reload(&store, &ctx, lead.id).await.assigned_to, Some(user_id));
}
