// Lead automation engines: scoring, assignment, duplicate detection, merge and workflow rules

pub mod assignment;
pub mod conditions;
pub mod duplicates;
pub mod merge;
pub mod notifier;
pub mod pipeline;
pub mod scoring;
pub mod workflow;

use thiserror::Error;

use crate::store::StoreError;

pub use assignment::{AssignmentEngine, AssignmentOutcome};
pub use conditions::{Condition, ConditionOperator, ConditionSet};
pub use duplicates::DuplicateDetector;
pub use merge::MergeService;
pub use notifier::{BroadcastNotifier, ChangeEvent, ChangeNotifier, NoopNotifier};
pub use pipeline::{AutomationPipeline, LeadAutomationOutcome};
pub use scoring::ScoringEngine;
pub use workflow::{ActionDispatcher, CrmActionDispatcher, WorkflowEngine, WorkflowWorker};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid rule definition or missing action configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Optimistic retry on shared state gave up
    #[error("concurrency conflict persisted after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    /// Rejected before any mutation
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;
