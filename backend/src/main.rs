use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod automation;
mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod store;
mod tenant;
mod websocket;

#[cfg(test)]
mod tests;

use automation::{
    ActionDispatcher, AssignmentEngine, AutomationPipeline, BroadcastNotifier, ChangeNotifier, CrmActionDispatcher,
    DuplicateDetector, MergeService, ScoringEngine, WorkflowEngine, WorkflowWorker,
};
use config::{Config, StoreBackend};
use jobs::{ExecutionLogs, JobConfig, JobScheduler};
use store::{MemoryStore, PgStore, SharedStore};

pub struct AppState {
    pub config: Config,
    pub store: SharedStore,
    /// Set when the store is Postgres; used by the health check
    pub db_pool: Option<sqlx::PgPool>,
    pub notifier: BroadcastNotifier,
    pub ws_manager: websocket::WsManager,
    pub pipeline: Arc<AutomationPipeline>,
    pub merge: Arc<MergeService>,
    pub worker: Arc<WorkflowWorker>,
    pub job_logs: ExecutionLogs,
}

impl AppState {
    pub fn new(config: Config, store: SharedStore, db_pool: Option<sqlx::PgPool>) -> Self {
        let notifier = BroadcastNotifier::default();
        let dispatcher: Arc<dyn ActionDispatcher> =
            Arc::new(CrmActionDispatcher::new(store.clone(), Arc::new(notifier.clone())));
        Self::with_dispatcher(config, store, db_pool, notifier, dispatcher)
    }

    /// Wires every engine against one store and one notifier.
    pub fn with_dispatcher(
        config: Config,
        store: SharedStore,
        db_pool: Option<sqlx::PgPool>,
        notifier: BroadcastNotifier,
        dispatcher: Arc<dyn ActionDispatcher>,
    ) -> Self {
        let sink: Arc<dyn ChangeNotifier> = Arc::new(notifier.clone());

        let scoring = Arc::new(ScoringEngine::new(store.clone(), sink.clone()));
        let assignment = Arc::new(AssignmentEngine::new(
            store.clone(),
            sink.clone(),
            config.assignment.clone(),
        ));
        let duplicates = Arc::new(DuplicateDetector::new(
            store.clone(),
            sink.clone(),
            config.duplicates.clone(),
        ));
        let workflow = Arc::new(WorkflowEngine::new(store.clone(), sink.clone()));
        let pipeline = Arc::new(AutomationPipeline::new(
            store.clone(),
            scoring,
            assignment,
            duplicates,
            workflow,
            config.scoring.clone(),
        ));
        let merge = Arc::new(MergeService::new(store.clone(), sink.clone()));
        let worker = Arc::new(WorkflowWorker::new(
            store.clone(),
            dispatcher,
            sink,
            config.workflow.clone(),
        ));

        Self {
            config,
            store,
            db_pool,
            notifier,
            ws_manager: websocket::WsManager::new(),
            pipeline,
            merge,
            worker,
            job_logs: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Leadflow Lead Automation API v0.1.0" }))
        .route("/health", get(handlers::health_check))
        .route("/ws", get(websocket::websocket_handler))
        .nest("/api/v1", handlers::api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

async fn open_store(config: &Config) -> anyhow::Result<(SharedStore, Option<sqlx::PgPool>)> {
    match config.store {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            Ok((Arc::new(MemoryStore::new()), None))
        }
        StoreBackend::Postgres => {
            let pool = database::create_pool(&config.database_url).await?;
            database::migrate(&pool).await?;
            Ok((Arc::new(PgStore::new(pool.clone())), Some(pool)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let (store, db_pool) = open_store(&config).await?;
    let app_state = Arc::new(AppState::new(config.clone(), store, db_pool));

    let mut scheduler = JobScheduler::new(
        app_state.store.clone(),
        app_state.worker.clone(),
        app_state.pipeline.scoring.clone(),
        JobConfig::from_workflow(&config.workflow),
        app_state.job_logs.clone(),
    )
    .await?;
    scheduler.start().await?;

    let app = router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}
