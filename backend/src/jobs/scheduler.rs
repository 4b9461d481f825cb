// Job Scheduler - workflow dispatch, stale-execution sweep and score recalculation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::automation::{EngineError, ScoringEngine, WorkflowWorker};
use crate::config::WorkflowConfig;
use crate::store::SharedStore;
use crate::tenant::TenantContext;

const MAX_EXECUTION_LOGS: usize = 100;

pub const WORKFLOW_DISPATCH: &str = "workflow_dispatch";
pub const STALE_SWEEP: &str = "stale_execution_sweep";
pub const SCORE_RECALCULATION: &str = "score_recalculation";

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Engine error: {0}")]
    EngineError(#[from] EngineError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub dispatch_interval_secs: u64,
    pub stale_sweep_cron: String,
    pub recalculation_cron: String,
}

impl JobConfig {
    pub fn from_workflow(workflow: &WorkflowConfig) -> Self {
        Self {
            dispatch_interval_secs: workflow.poll_interval_secs,
            ..Self::default()
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: 10,
            // every minute
            stale_sweep_cron: "0 * * * * *".to_string(),
            // top of every hour
            recalculation_cron: "0 0 * * * *".to_string(),
        }
    }
}

/// Six-field cron expression firing every `secs` seconds, rounded to whole minutes past 59s.
pub fn interval_cron(secs: u64) -> String {
    match secs {
        0 | 1 => "* * * * * *".to_string(),
        s if s < 60 => format!("*/{} * * * * *", s),
        s => format!("0 */{} * * * *", (s / 60).clamp(1, 59)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: u64,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

/// What one run of a job did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRunReport {
    pub items_processed: u64,
    pub errors: Vec<String>,
}

/// Shared ring of recent runs, also read by the HTTP layer.
pub type ExecutionLogs = Arc<RwLock<Vec<JobExecutionLog>>>;

async fn push_log(logs: &ExecutionLogs, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    if logs.len() > MAX_EXECUTION_LOGS {
        let excess = logs.len() - MAX_EXECUTION_LOGS;
        logs.drain(..excess);
    }
}

/// Runs `job` and appends its execution log.
async fn run_logged<F>(logs: &ExecutionLogs, job_name: &str, job: F) -> JobResult<JobRunReport>
where
    F: Future<Output = JobResult<JobRunReport>>,
{
    let started_at = Utc::now();
    let result = job.await;
    let completed_at = Utc::now();

    let (status, items_processed, errors) = match &result {
        Ok(report) if report.errors.is_empty() => (JobStatus::Completed, report.items_processed, Vec::new()),
        Ok(report) => (JobStatus::PartialFailure, report.items_processed, report.errors.clone()),
        Err(e) => (JobStatus::Failed, 0, vec![e.to_string()]),
    };

    if status != JobStatus::Completed {
        warn!(job = job_name, status = ?status, errors = errors.len(), "Background job finished with errors");
    }

    push_log(
        logs,
        JobExecutionLog {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            started_at,
            completed_at: Some(completed_at),
            status,
            items_processed,
            errors,
            duration_ms: Some((completed_at - started_at).num_milliseconds()),
        },
    )
    .await;

    result
}

pub async fn run_workflow_dispatch(worker: &WorkflowWorker) -> JobResult<JobRunReport> {
    let summary = worker.run_once(Utc::now()).await?;
    let mut report = JobRunReport {
        items_processed: (summary.completed + summary.failed) as u64,
        errors: Vec::new(),
    };
    if summary.errored > 0 {
        report
            .errors
            .push(format!("{} executions could not be processed", summary.errored));
    }
    Ok(report)
}

pub async fn run_stale_sweep(worker: &WorkflowWorker) -> JobResult<JobRunReport> {
    let swept = worker.sweep_stale(Utc::now()).await?;
    Ok(JobRunReport {
        items_processed: swept,
        errors: Vec::new(),
    })
}

/// Re-projects decayed scores for every tenant that has leads. One tenant failing does not stop the rest.
pub async fn run_score_recalculation(store: &SharedStore, scoring: &ScoringEngine) -> JobResult<JobRunReport> {
    let tenants = store.list_tenants().await.map_err(EngineError::from)?;
    let now = Utc::now();
    let mut report = JobRunReport::default();

    for tenant_id in tenants {
        match scoring.recalculate_scores(&TenantContext::system(tenant_id), now).await {
            Ok(summary) => report.items_processed += summary.leads_updated as u64,
            Err(e) => report.errors.push(format!("tenant {}: {}", tenant_id, e)),
        }
    }

    Ok(report)
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    store: SharedStore,
    worker: Arc<WorkflowWorker>,
    scoring: Arc<ScoringEngine>,
    config: JobConfig,
    execution_logs: ExecutionLogs,
}

impl JobScheduler {
    pub async fn new(
        store: SharedStore,
        worker: Arc<WorkflowWorker>,
        scoring: Arc<ScoringEngine>,
        config: JobConfig,
        execution_logs: ExecutionLogs,
    ) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            store,
            worker,
            scoring,
            config,
            execution_logs,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_workflow_dispatch().await?;
        self.schedule_stale_sweep().await?;
        self.schedule_score_recalculation().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_workflow_dispatch(&self) -> JobResult<()> {
        let cron_expr = interval_cron(self.config.dispatch_interval_secs);
        let worker = self.worker.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let worker = worker.clone();
            let logs = logs.clone();

            Box::pin(async move {
                if let Err(e) = run_logged(&logs, WORKFLOW_DISPATCH, run_workflow_dispatch(&worker)).await {
                    error!("Workflow dispatch failed: {}", e);
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled workflow dispatch ({})", cron_expr);

        Ok(())
    }

    async fn schedule_stale_sweep(&self) -> JobResult<()> {
        let worker = self.worker.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(self.config.stale_sweep_cron.as_str(), move |_uuid, _lock| {
            let worker = worker.clone();
            let logs = logs.clone();

            Box::pin(async move {
                if let Err(e) = run_logged(&logs, STALE_SWEEP, run_stale_sweep(&worker)).await {
                    error!("Stale execution sweep failed: {}", e);
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled stale execution sweep ({})", self.config.stale_sweep_cron);

        Ok(())
    }

    async fn schedule_score_recalculation(&self) -> JobResult<()> {
        let store = self.store.clone();
        let scoring = self.scoring.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(self.config.recalculation_cron.as_str(), move |_uuid, _lock| {
            let store = store.clone();
            let scoring = scoring.clone();
            let logs = logs.clone();

            Box::pin(async move {
                if let Err(e) = run_logged(&logs, SCORE_RECALCULATION, run_score_recalculation(&store, &scoring)).await {
                    error!("Score recalculation failed: {}", e);
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled score recalculation ({})", self.config.recalculation_cron);

        Ok(())
    }
}
