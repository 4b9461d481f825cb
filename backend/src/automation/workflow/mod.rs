// Workflow rules: trigger path (engine), action execution (dispatcher) and the
// poller that advances due executions (worker).

pub mod dispatcher;
pub mod engine;
pub mod worker;

pub use dispatcher::{ActionDispatcher, ActionError, ActionTarget, CrmActionDispatcher, action_types, render_templates};
pub use engine::{EXECUTION_ENTITY, WorkflowEngine};
pub use worker::{DispatchSummary, RULE_INACTIVE_ERROR, WorkflowWorker};
