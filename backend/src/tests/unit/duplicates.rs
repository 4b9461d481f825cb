use leadflow_shared::{DuplicateStatus, MatchType};

use crate::automation::EngineError;
use crate::store::DuplicateStore;
use crate::tests::fixtures;
use crate::tests::helpers::{duplicate_detector, init_tracing, memory_store, seed_lead, tenant};

#[tokio::test]
async fn test_email_match_in_other_case() {
    init_tracing();
    let store = memory_store();
    let ctx = tenant();
    let detector = duplicate_detector(&store);

    let mut original = fixtures::named_lead(ctx.tenant_id, "Ann", "Lee");
    original.email = Some("ann.lee@acme.io".to_string());
    let original = seed_lead(&store, &ctx, original).await;

    let mut incoming = fixtures::named_lead(ctx.tenant_id, "A.", "Lee");
    incoming.email = Some("  ANN.LEE@ACME.IO".to_string());
    let incoming = seed_lead(&store, &ctx, incoming).await;

    let found = detector.find_duplicates(&ctx, &incoming).await.unwrap();

    assert_eq!(found.len(), 1);
    let suggestion = &found[0];
    assert!(suggestion.involves(original.id) && suggestion.involves(incoming.id));
    assert!(suggestion.lead1_id < suggestion.lead2_id);
    assert!(suggestion.confidence_score >= 70);
    assert_eq!(suggestion.match_type, MatchType::Email);
    assert_eq!(suggestion.status, DuplicateStatus::Pending);

    // scanning from either side returns the stored pair
    let again = detector.find_duplicates(&ctx, &original).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, suggestion.id);
    assert_eq!(detector.list_suggestions(&ctx, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_fuzzy_name_alone_is_below_floor() {
    let store = memory_store();
    let ctx = tenant();
    let detector = duplicate_detector(&store);

    let mut a = fixtures::named_lead(ctx.tenant_id, "Jon", "Smith");
    a.company_name = Some("Acme Corp".to_string());
    seed_lead(&store, &ctx, a).await;
    let mut b = fixtures::named_lead(ctx.tenant_id, "John", "Smith");
    b.company_name = Some("ACME corp.".to_string());
    let b = seed_lead(&store, &ctx, b).await;

    assert!(detector.find_duplicates(&ctx, &b).await.unwrap().is_empty());
    assert!(store.list_duplicates(&ctx, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_phone_and_fuzzy_name_combine() {
    let store = memory_store();
    let ctx = tenant();
    let detector = duplicate_detector(&store);

    let mut a = fixtures::named_lead(ctx.tenant_id, "Jon", "Smith");
    a.company_name = Some("Acme Corp".to_string());
    a.phone = Some("+1 (555) 010-9999".to_string());
    seed_lead(&store, &ctx, a).await;
    let mut b = fixtures::named_lead(ctx.tenant_id, "John", "Smith");
    b.company_name = Some("Acme Corp".to_string());
    b.phone = Some("15550109999".to_string());
    let b = seed_lead(&store, &ctx, b).await;

    let found = detector.find_duplicates(&ctx, &b).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].confidence_score, 70);
    assert_eq!(found[0].match_type, MatchType::NamePhone);
}

#[tokio::test]
async fn test_deleted_leads_are_not_candidates() {
    let store = memory_store();
    let ctx = tenant();
    let detector = duplicate_detector(&store);

    let mut gone = fixtures::named_lead(ctx.tenant_id, "Ann", "Lee");
    gone.email = Some("ann@acme.io".to_string());
    gone.is_deleted = true;
    seed_lead(&store, &ctx, gone).await;
    let mut b = fixtures::named_lead(ctx.tenant_id, "Ann", "Lee");
    b.email = Some("ann@acme.io".to_string());
    let b = seed_lead(&store, &ctx, b).await;

    assert!(detector.find_duplicates(&ctx, &b).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resolution_is_final() {
    let store = memory_store();
    let ctx = tenant();
    let detector = duplicate_detector(&store);

    let mut a = fixtures::named_lead(ctx.tenant_id, "Ann", "Lee");
    a.email = Some("ann@acme.io".to_string());
    seed_lead(&store, &ctx, a).await;
    let mut b = fixtures::named_lead(ctx.tenant_id, "Anne", "Lee");
    b.email = Some("ann@acme.io".to_string());
    let b = seed_lead(&store, &ctx, b).await;
    let suggestion = detector.find_duplicates(&ctx, &b).await.unwrap().remove(0);

    assert!(matches!(
        detector.resolve(&ctx, suggestion.id, DuplicateStatus::Pending).await,
        Err(EngineError::DataIntegrity(_))
    ));

    let confirmed = detector.resolve(&ctx, suggestion.id, DuplicateStatus::Confirmed).await.unwrap();
    assert_eq!(confirmed.status, DuplicateStatus::Confirmed);
    assert!(confirmed.resolved_at.is_some());
    assert_eq!(confirmed.resolved_by, ctx.actor_id);

    assert!(matches!(
        detector.resolve(&ctx, suggestion.id, DuplicateStatus::Dismissed).await,
        Err(EngineError::DataIntegrity(_))
    ));

    let pending = detector.list_suggestions(&ctx, Some(DuplicateStatus::Pending)).await.unwrap();
    assert!(pending.is_empty());

    // a rescan keeps the human decision
    let rescanned = detector.find_duplicates(&ctx, &b).await.unwrap();
    assert_eq!(rescanned[0].status, DuplicateStatus::Confirmed);
}

#[tokio::test]
async fn test_duplicates_stay_within_tenant() {
    let store = memory_store();
    let ctx = tenant();
    let other = tenant();
    let detector = duplicate_detector(&store);

    let mut theirs = fixtures::named_lead(other.tenant_id, "Ann", "Lee");
    theirs.email = Some("ann@acme.io".to_string());
    seed_lead(&store, &other, theirs).await;
    let mut ours = fixtures::named_lead(ctx.tenant_id, "Ann", "Lee");
    ours.email = Some("ann@acme.io".to_string());
    let ours = seed_lead(&store, &ctx, ours).await;

    assert!(detector.find_duplicates(&ctx, &ours).await.unwrap().is_empty());

    let missing = detector.resolve(&other, uuid::Uuid::new_v4(), DuplicateStatus::Dismissed).await;
    assert!(matches!(missing, Err(EngineError::NotFound(_))));
}
