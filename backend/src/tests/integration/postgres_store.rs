// Postgres repositories. Skipped unless TEST_DATABASE_URL points at a disposable database.

use chrono::Utc;
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use uuid::Uuid;

use leadflow_shared::{AssignmentType, DuplicateStatus, ExecutionStatus, LeadDuplicate, MatchType, WorkflowExecution};

use crate::database;
use crate::store::{
    AssignmentStore, DuplicateStore, ExecutionOutcome, LeadStore, PgStore, SharedStore, WorkflowStore,
};
use crate::tests::fixtures;
use crate::tests::helpers::{assignment_engine, init_tracing, merge_service, seed_lead, tenant};

async fn pg_store() -> Option<SharedStore> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };
    init_tracing();
    let pool = database::create_pool(&url).await.expect("Failed to connect to test database");
    database::migrate(&pool).await.expect("Failed to run migrations");
    Some(Arc::new(PgStore::new(pool)))
}

#[tokio::test]
#[serial]
async fn test_pg_cursor_compare_and_swap() {
    let Some(store) = pg_store().await else { return };
    let ctx = tenant();

    let rule = fixtures::assignment_rule(ctx.tenant_id, AssignmentType::RoundRobin);
    store.insert_assignment_rule(&ctx, &rule).await.unwrap();
    let first = store
        .insert_member(&ctx, &fixtures::member(ctx.tenant_id, rule.id, 5, None))
        .await
        .unwrap();
    let second = store
        .insert_member(&ctx, &fixtures::member(ctx.tenant_id, rule.id, 5, None))
        .await
        .unwrap();
    assert_eq!((first.position, second.position), (0, 1));

    assert!(store.update_cursor(&ctx, rule.id, 0, 0).await.unwrap());
    assert!(!store.update_cursor(&ctx, rule.id, 0, 1).await.unwrap());

    let stored = store.get_assignment_rule(&ctx, rule.id).await.unwrap().unwrap();
    assert_eq!((stored.last_assigned_index, stored.version), (0, 1));

    let lead = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let outcome = assignment_engine(&store).assign(&ctx, &lead).await.unwrap().unwrap();
    assert_eq!(outcome.user_id, second.user_id);
}

#[tokio::test]
#[serial]
async fn test_pg_execution_claimed_once() {
    let Some(store) = pg_store().await else { return };
    let ctx = tenant();
    let now = Utc::now();

    let rule = fixtures::workflow_rule(ctx.tenant_id, "Lead", "created", "create_task", json!({}));
    store.insert_workflow_rule(&ctx, &rule).await.unwrap();
    let execution = WorkflowExecution {
        id: Uuid::new_v4(),
        tenant_id: ctx.tenant_id,
        rule_id: rule.id,
        entity_type: "Lead".to_string(),
        entity_id: Uuid::new_v4(),
        snapshot: json!({}),
        status: ExecutionStatus::Pending,
        scheduled_for: now,
        claimed_at: None,
        executed_on: None,
        result: None,
        error: None,
        created_at: now,
    };
    store.insert_execution(&ctx, &execution).await.unwrap();

    let (a, b) = tokio::join!(
        store.claim_execution(execution.id, now),
        store.claim_execution(execution.id, now)
    );
    assert!(a.unwrap() ^ b.unwrap());

    let outcome = ExecutionOutcome::completed(json!({ "ok": true }));
    assert!(store.finish_execution(execution.id, &outcome, now).await.unwrap());
    assert!(!store.finish_execution(execution.id, &outcome, now).await.unwrap());

    let stored = store.get_execution(&ctx, execution.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);
    assert_eq!(stored.result, Some(json!({ "ok": true })));
}

#[tokio::test]
#[serial]
async fn test_pg_merge_is_applied_together() {
    let Some(store) = pg_store().await else { return };
    let ctx = tenant();

    let survivor = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let loser = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let suggestion = LeadDuplicate::between(ctx.tenant_id, survivor.id, loser.id, MatchType::Email, 70);
    assert!(store.insert_duplicate(&ctx, &suggestion).await.unwrap());
    // same pair in the other order
    let mirrored = LeadDuplicate::between(ctx.tenant_id, loser.id, survivor.id, MatchType::Email, 70);
    assert!(!store.insert_duplicate(&ctx, &mirrored).await.unwrap());

    merge_service(&store).merge(&ctx, survivor.id, &[loser.id]).await.unwrap();

    assert!(store.get_lead(&ctx, loser.id).await.unwrap().is_none());
    let resolved = store.get_duplicate(&ctx, suggestion.id).await.unwrap().unwrap();
    assert_eq!(resolved.status, DuplicateStatus::Confirmed);
    assert_eq!(merge_service(&store).history(&ctx, survivor.id).await.unwrap().len(), 1);
}
