// send_webhook against a local mock server

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use leadflow_shared::{ExecutionStatus, WorkflowExecution};

use crate::automation::CrmActionDispatcher;
use crate::store::{SharedStore, WorkflowStore};
use crate::tenant::TenantContext;
use crate::tests::fixtures;
use crate::tests::helpers::{init_tracing, memory_store, noop, seed_lead, tenant, worker, workflow_engine};

/// Fires one `created` event for a fresh lead against a webhook rule and runs the worker once.
async fn fire_webhook(store: &SharedStore, ctx: &TenantContext, config: serde_json::Value) -> WorkflowExecution {
    let rule = fixtures::workflow_rule(ctx.tenant_id, "Lead", "created", "send_webhook", config);
    store.insert_workflow_rule(ctx, &rule).await.unwrap();
    let lead = seed_lead(store, ctx, fixtures::named_lead(ctx.tenant_id, "Ada", "Lovelace")).await;

    let scheduled = workflow_engine(store)
        .on_event(ctx, "Lead", "created", lead.id, &lead.to_snapshot())
        .await
        .unwrap();
    let dispatcher = Arc::new(CrmActionDispatcher::new(store.clone(), noop()));
    worker(store, dispatcher).run_once(Utc::now()).await.unwrap();

    store.get_execution(ctx, scheduled[0].id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_webhook_success_completes_execution() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/leads"))
        .and(header("x-api-key", "secret"))
        .and(body_partial_json(json!({ "lead": "Ada Lovelace", "event": "created" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = memory_store();
    let ctx = tenant();
    let execution = fire_webhook(
        &store,
        &ctx,
        json!({
            "url": format!("{}/hooks/leads", server.uri()),
            "headers": { "x-api-key": "secret" },
            "payload": { "lead": "{{full_name}}", "event": "created" }
        }),
    )
    .await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.result.unwrap()["status_code"], 200);
}

#[tokio::test]
async fn test_webhook_default_payload_carries_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/sync"))
        .and(body_partial_json(json!({ "entity_type": "Lead", "entity": { "full_name": "Ada Lovelace" } })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let store = memory_store();
    let ctx = tenant();
    let execution = fire_webhook(
        &store,
        &ctx,
        json!({ "url": format!("{}/sync", server.uri()), "method": "put" }),
    )
    .await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_webhook_server_error_fails_execution() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = memory_store();
    let ctx = tenant();
    let url = format!("{}/hooks/leads", server.uri());
    let execution = fire_webhook(&store, &ctx, json!({ "url": url })).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error, Some(format!("webhook {} returned 500", url)));
}
