use chrono::Utc;
use uuid::Uuid;

use leadflow_shared::{DuplicateStatus, EntityRef, LeadCommunication, LeadDuplicate, MatchType, OpportunityStatus};

use crate::automation::EngineError;
use crate::store::{ActivityStore, DuplicateStore, LeadStore};
use crate::tests::fixtures;
use crate::tests::helpers::{init_tracing, memory_store, merge_service, reload, seed_lead, tenant};

#[tokio::test]
async fn test_merge_relinks_and_soft_deletes() {
    init_tracing();
    let store = memory_store();
    let ctx = tenant();
    let service = merge_service(&store);

    let mut a = fixtures::named_lead(ctx.tenant_id, "Ann", "Lee");
    a.email = Some("ann@acme.io".to_string());
    let a = seed_lead(&store, &ctx, a).await;
    let mut b = fixtures::named_lead(ctx.tenant_id, "Ann", "Lee");
    b.email = Some("ann@acme.io".to_string());
    b.phone = Some("555-0100".to_string());
    let b = seed_lead(&store, &ctx, b).await;
    let mut c = fixtures::named_lead(ctx.tenant_id, "A", "Lee");
    c.company_name = Some("Acme".to_string());
    let c = seed_lead(&store, &ctx, c).await;

    let call = fixtures::activity(ctx.tenant_id, "Intro call");
    store.insert_activity(&ctx, &call, &[EntityRef::lead(b.id)]).await.unwrap();
    let open = fixtures::opportunity(ctx.tenant_id, c.id, OpportunityStatus::Open);
    let won = fixtures::opportunity(ctx.tenant_id, c.id, OpportunityStatus::Won);
    store.insert_opportunity(&ctx, &open).await.unwrap();
    store.insert_opportunity(&ctx, &won).await.unwrap();
    store
        .insert_communication(
            &ctx,
            &LeadCommunication {
                id: Uuid::new_v4(),
                tenant_id: ctx.tenant_id,
                lead_id: b.id,
                channel: "email".to_string(),
                subject: Some("Pricing".to_string()),
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    let suggestion = LeadDuplicate::between(ctx.tenant_id, a.id, b.id, MatchType::Email, 70);
    store.insert_duplicate(&ctx, &suggestion).await.unwrap();

    let survivor = service.merge(&ctx, a.id, &[b.id, c.id]).await.unwrap();

    assert_eq!(survivor.id, a.id);
    assert_eq!(survivor.email.as_deref(), Some("ann@acme.io"));
    assert_eq!(survivor.phone.as_deref(), Some("555-0100"));
    assert_eq!(survivor.company_name.as_deref(), Some("Acme"));

    assert!(store.get_lead(&ctx, b.id).await.unwrap().is_none());
    assert!(store.get_lead(&ctx, c.id).await.unwrap().is_none());

    let links = store.list_activity_links(&ctx, &EntityRef::lead(a.id)).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].activity_id, call.id);
    assert!(store.list_activity_links(&ctx, &EntityRef::lead(b.id)).await.unwrap().is_empty());

    let relinked = store.list_opportunities_for_lead(&ctx, a.id).await.unwrap();
    assert_eq!(relinked.iter().map(|o| o.id).collect::<Vec<_>>(), vec![open.id]);
    // closed opportunities keep their history
    let closed = store.list_opportunities_for_lead(&ctx, c.id).await.unwrap();
    assert_eq!(closed.iter().map(|o| o.id).collect::<Vec<_>>(), vec![won.id]);

    assert_eq!(store.list_communications(&ctx, a.id).await.unwrap().len(), 1);

    let history = service.history(&ctx, a.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].merged_lead_ids, vec![b.id, c.id]);
    assert_eq!(history[0].merged_by, ctx.actor_id);
    let snapshots = history[0].snapshot.as_array().unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0]["phone"], "555-0100");

    let resolved = store.get_duplicate(&ctx, suggestion.id).await.unwrap().unwrap();
    assert_eq!(resolved.status, DuplicateStatus::Confirmed);
}

#[tokio::test]
async fn test_survivor_in_duplicate_list_is_rejected() {
    let store = memory_store();
    let ctx = tenant();
    let service = merge_service(&store);
    let a = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let b = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    let result = service.merge(&ctx, a.id, &[b.id, a.id]).await;

    assert!(matches!(result, Err(EngineError::DataIntegrity(_))));
    assert!(store.get_lead(&ctx, b.id).await.unwrap().is_some());
    assert!(service.history(&ctx, a.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_repeated_duplicate_is_rejected() {
    let store = memory_store();
    let ctx = tenant();
    let service = merge_service(&store);
    let a = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let b = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    assert!(matches!(
        service.merge(&ctx, a.id, &[b.id, b.id]).await,
        Err(EngineError::DataIntegrity(_))
    ));
    assert!(matches!(
        service.merge(&ctx, a.id, &[]).await,
        Err(EngineError::DataIntegrity(_))
    ));
}

#[tokio::test]
async fn test_missing_lead_aborts_whole_merge() {
    let store = memory_store();
    let ctx = tenant();
    let service = merge_service(&store);
    let a = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let b = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    let result = service.merge(&ctx, a.id, &[b.id, Uuid::new_v4()]).await;

    assert!(matches!(result, Err(EngineError::NotFound(_))));
    assert!(store.get_lead(&ctx, b.id).await.unwrap().is_some());
    assert!(service.history(&ctx, a.id).await.unwrap().is_empty());
    assert_eq!(reload(&store, &ctx, a.id).await.email, a.email);
}

#[tokio::test]
async fn test_merged_lead_cannot_be_merged_again() {
    let store = memory_store();
    let ctx = tenant();
    let service = merge_service(&store);
    let a = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let b = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let c = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;

    service.merge(&ctx, a.id, &[b.id]).await.unwrap();

    assert!(matches!(
        service.merge(&ctx, c.id, &[b.id]).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_cross_tenant_lead_is_not_found() {
    let store = memory_store();
    let ctx = tenant();
    let other = tenant();
    let service = merge_service(&store);
    let ours = seed_lead(&store, &ctx, fixtures::lead(ctx.tenant_id)).await;
    let theirs = seed_lead(&store, &other, fixtures::lead(other.tenant_id)).await;

    assert!(matches!(
        service.merge(&ctx, ours.id, &[theirs.id]).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(store.get_lead(&other, theirs.id).await.unwrap().is_some());
}
