// Rule administration over HTTP

use axum::http::{Method, StatusCode};
use serde_json::json;
use uuid::Uuid;

use crate::tests::helpers::{init_tracing, memory_store, send_json, tenant, test_state};

#[tokio::test]
async fn test_missing_tenant_header_is_rejected() {
    init_tracing();
    let state = test_state(memory_store());

    let (status, body) = send_json(state, Method::GET, "/api/v1/scoring-rules", None, None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "MISSING_TENANT");
}

#[tokio::test]
async fn test_invalid_condition_rejected_at_save_time() {
    let state = test_state(memory_store());
    let ctx = tenant();

    let (status, body) = send_json(
        state.clone(),
        Method::POST,
        "/api/v1/scoring-rules",
        Some(&ctx),
        Some(json!({
            "name": "Big budget",
            "category": "profile",
            "condition": { "field": "estimated_value", "operator": "between", "value": [1, 2] },
            "score_delta": 10
        })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["details"]["condition"].is_array());

    let (_, listed) = send_json(state, Method::GET, "/api/v1/scoring-rules", Some(&ctx), None).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn test_scoring_rule_needs_condition_and_delta() {
    let state = test_state(memory_store());
    let ctx = tenant();

    let (status, body) = send_json(
        state,
        Method::POST,
        "/api/v1/scoring-rules",
        Some(&ctx),
        Some(json!({ "name": "Anything", "category": "profile", "condition": {}, "score_delta": 0 })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["details"]["condition"].is_array());
    assert!(body["details"]["score_delta"].is_array());
}

#[tokio::test]
async fn test_scoring_rule_lifecycle() {
    let state = test_state(memory_store());
    let ctx = tenant();

    let (status, created) = send_json(
        state.clone(),
        Method::POST,
        "/api/v1/scoring-rules",
        Some(&ctx),
        Some(json!({
            "name": "  Has phone ",
            "category": "profile",
            "condition": { "field": "has_phone", "operator": "equals", "value": true },
            "score_delta": 15,
            "decay_days": 30
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "Has phone");
    assert_eq!(created["created_by"], json!(ctx.actor_id));
    let id = created["id"].as_str().unwrap().to_string();

    let (status, updated) = send_json(
        state.clone(),
        Method::PUT,
        &format!("/api/v1/scoring-rules/{}", id),
        Some(&ctx),
        Some(json!({ "score_delta": 20, "decay_days": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["score_delta"], 20);
    assert!(updated["decay_days"].is_null());

    let (status, _) = send_json(
        state.clone(),
        Method::DELETE,
        &format!("/api/v1/scoring-rules/{}", id),
        Some(&ctx),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, fetched) = send_json(
        state.clone(),
        Method::GET,
        &format!("/api/v1/scoring-rules/{}", id),
        Some(&ctx),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["is_active"], false);

    // another tenant cannot see it
    let (status, _) = send_json(
        state,
        Method::GET,
        &format!("/api/v1/scoring-rules/{}", id),
        Some(&tenant()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_assignment_members_keep_insertion_order() {
    let state = test_state(memory_store());
    let ctx = tenant();

    let (status, rule) = send_json(
        state.clone(),
        Method::POST,
        "/api/v1/assignment-rules",
        Some(&ctx),
        Some(json!({ "name": "Inbound", "assignment_type": "round_robin", "criteria": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(rule["criteria"].is_null());
    assert_eq!(rule["last_assigned_index"], -1);
    assert_eq!(rule["priority"], 100);
    let rule_id = rule["id"].as_str().unwrap().to_string();

    let mut positions = Vec::new();
    for _ in 0..2 {
        let (status, member) = send_json(
            state.clone(),
            Method::POST,
            &format!("/api/v1/assignment-rules/{}/members", rule_id),
            Some(&ctx),
            Some(json!({ "user_id": Uuid::new_v4() })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(member["max_capacity"], 50);
        positions.push(member["position"].as_i64().unwrap());
    }
    assert_eq!(positions, vec![0, 1]);

    let (_, members) = send_json(
        state.clone(),
        Method::GET,
        &format!("/api/v1/assignment-rules/{}/members", rule_id),
        Some(&ctx),
        None,
    )
    .await;
    let member_id = members[0]["id"].as_str().unwrap().to_string();

    let (status, member) = send_json(
        state.clone(),
        Method::PUT,
        &format!("/api/v1/assignment-rules/{}/members/{}", rule_id, member_id),
        Some(&ctx),
        Some(json!({ "is_active": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(member["is_active"], false);

    let (status, _) = send_json(
        state,
        Method::POST,
        &format!("/api/v1/assignment-rules/{}/members", Uuid::new_v4()),
        Some(&ctx),
        Some(json!({ "user_id": Uuid::new_v4() })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_workflow_rule_action_is_checked() {
    let state = test_state(memory_store());
    let ctx = tenant();

    let (status, body) = send_json(
        state.clone(),
        Method::POST,
        "/api/v1/workflow-rules",
        Some(&ctx),
        Some(json!({
            "name": "Launch",
            "entity_type": "Lead",
            "trigger_event": "created",
            "action_type": "launch_rocket"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["details"]["action_type"].is_array());

    let (status, body) = send_json(
        state.clone(),
        Method::POST,
        "/api/v1/workflow-rules",
        Some(&ctx),
        Some(json!({
            "name": "Notify CRM",
            "entity_type": "Lead",
            "trigger_event": "created",
            "action_type": "send_webhook",
            "action_config": { "method": "POST" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["details"]["action_config"].is_array());

    let (status, body) = send_json(
        state.clone(),
        Method::POST,
        "/api/v1/workflow-rules",
        Some(&ctx),
        Some(json!({
            "name": "Far future",
            "entity_type": "Lead",
            "trigger_event": "created",
            "action_type": "create_follow_up",
            "action_config": { "days_after": 1_000_000_000 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["details"]["action_config"].is_array());

    let (status, created) = send_json(
        state.clone(),
        Method::POST,
        "/api/v1/workflow-rules",
        Some(&ctx),
        Some(json!({
            "name": "Call back",
            "entity_type": "Lead",
            "trigger_event": "created",
            "action_type": "Create-Task",
            "delay_minutes": 15
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["action_type"], "create_task");
    assert_eq!(created["action_config"], json!({}));
    let id = created["id"].as_str().unwrap().to_string();

    let (status, _) = send_json(
        state.clone(),
        Method::DELETE,
        &format!("/api/v1/workflow-rules/{}", id),
        Some(&ctx),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, listed) = send_json(state.clone(), Method::GET, "/api/v1/workflow-rules", Some(&ctx), None).await;
    assert_eq!(listed, json!([]));
    let (status, _) = send_json(
        state,
        Method::GET,
        &format!("/api/v1/workflow-rules/{}", id),
        Some(&ctx),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
