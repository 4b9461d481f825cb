// Background jobs
//
// Scheduled with tokio-cron-scheduler: workflow dispatch, the stale-execution
// sweep and hourly score recalculation so decayed points leave lead scores.

pub mod scheduler;

pub use scheduler::{ExecutionLogs, JobConfig, JobExecutionLog, JobScheduler};
