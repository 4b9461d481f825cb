use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
};
use serde_json::Value;
use std::sync::{Arc, Once};
use tower::ServiceExt;
use uuid::Uuid;

use leadflow_shared::Lead;

use crate::automation::{
    ActionDispatcher, AssignmentEngine, BroadcastNotifier, ChangeNotifier, DuplicateDetector, MergeService,
    NoopNotifier, ScoringEngine, WorkflowEngine, WorkflowWorker,
};
use crate::config::{Config, StoreBackend};
use crate::store::{LeadStore, MemoryStore, SharedStore};
use crate::tenant::{TenantContext, TENANT_HEADER, USER_HEADER};
use crate::{router, AppState};

static TRACING: Once = Once::new();

/// Routes engine logs through the test writer; RUST_LOG=debug to see them.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn memory_store() -> SharedStore {
    Arc::new(MemoryStore::new())
}

pub fn tenant() -> TenantContext {
    TenantContext::new(Uuid::new_v4()).with_actor(Uuid::new_v4())
}

pub fn noop() -> Arc<dyn ChangeNotifier> {
    Arc::new(NoopNotifier)
}

/// Defaults with fast retries and a one second action timeout
pub fn test_config() -> Config {
    let mut config = Config {
        store: StoreBackend::Memory,
        ..Config::default()
    };
    config.assignment.backoff_base_ms = 1;
    config.assignment.max_attempts = 50;
    config.workflow.action_timeout_secs = 1;
    config
}

pub fn scoring_engine(store: &SharedStore) -> ScoringEngine {
    ScoringEngine::new(store.clone(), noop())
}

pub fn assignment_engine(store: &SharedStore) -> AssignmentEngine {
    AssignmentEngine::new(store.clone(), noop(), test_config().assignment)
}

pub fn duplicate_detector(store: &SharedStore) -> DuplicateDetector {
    DuplicateDetector::new(store.clone(), noop(), test_config().duplicates)
}

pub fn merge_service(store: &SharedStore) -> MergeService {
    MergeService::new(store.clone(), noop())
}

pub fn workflow_engine(store: &SharedStore) -> WorkflowEngine {
    WorkflowEngine::new(store.clone(), noop())
}

pub fn worker(store: &SharedStore, dispatcher: Arc<dyn ActionDispatcher>) -> WorkflowWorker {
    WorkflowWorker::new(store.clone(), dispatcher, noop(), test_config().workflow)
}

pub async fn seed_lead(store: &SharedStore, ctx: &TenantContext, lead: Lead) -> Lead {
    store.insert_lead(ctx, &lead).await.expect("Failed to insert lead");
    lead
}

pub async fn reload(store: &SharedStore, ctx: &TenantContext, lead_id: Uuid) -> Lead {
    store
        .get_lead(ctx, lead_id)
        .await
        .expect("Failed to read lead")
        .expect("Lead missing")
}

pub fn test_state(store: SharedStore) -> Arc<AppState> {
    Arc::new(AppState::new(test_config(), store, None))
}

pub fn test_state_with_dispatcher(store: SharedStore, dispatcher: Arc<dyn ActionDispatcher>) -> Arc<AppState> {
    Arc::new(AppState::with_dispatcher(
        test_config(),
        store,
        None,
        BroadcastNotifier::default(),
        dispatcher,
    ))
}

/// Sends one request through the full router and decodes the JSON reply (Null when empty).
pub async fn send_json(
    state: Arc<AppState>,
    method: Method,
    uri: &str,
    ctx: Option<&TenantContext>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(ctx) = ctx {
        request = request.header(TENANT_HEADER, ctx.tenant_id.to_string());
        if let Some(actor) = ctx.actor_id {
            request = request.header(USER_HEADER, actor.to_string());
        }
    }

    let request = match body {
        Some(body) => request
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .expect("Failed to build request");

    let response = router(state).oneshot(request).await.expect("Request failed");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");

    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, json)
}
