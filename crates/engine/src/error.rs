//! Engine-level error types.

use thiserror::Error;

/// A YAML fragment plan assembly could not turn into plan nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedField {
    pub uuid: String,
    pub name: String,
}

impl std::fmt::Display for UnresolvedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

fn join_fields(fields: &[UnresolvedField]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors produced by the orchestration engine (assembly + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Plan assembly errors ------

    /// Fragments remained after assembly stopped making progress.
    #[error("unresolvable YAML fields: {}", join_fields(.unresolved))]
    UnresolvableYaml { unresolved: Vec<UnresolvedField> },

    /// No plan creator designated a starting node.
    #[error("plan has no starting node")]
    NoStartingNode,

    /// A plan creator service failed; assembly is aborted.
    #[error("plan creator '{service}' failed: {message}")]
    PlanCreator { service: String, message: String },

    /// An assembly iteration exceeded the configured timeout.
    #[error("plan creation iteration {iteration} timed out")]
    PlanCreationTimeout { iteration: usize },

    #[error("invalid pipeline YAML: {0}")]
    InvalidYaml(String),

    // ------ Plan validation errors ------

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    // ------ Execution errors ------

    /// No adviser of the node accepted the event; the plan cannot proceed.
    #[error("no adviser could advise node execution '{node_execution_id}'")]
    AdviserExhausted { node_execution_id: String },

    #[error("no adviser registered for type '{0}'")]
    AdviserNotRegistered(String),

    #[error("no step registered for type '{0}'")]
    StepNotRegistered(String),

    /// The facilitator chose a mode the registered step does not serve.
    #[error("step '{step_type}' facilitated as {facilitated} but implements {implemented}")]
    ModeMismatch {
        step_type: String,
        facilitated: steps::ExecutionMode,
        implemented: steps::ExecutionMode,
    },

    #[error("invalid children for node '{node_id}': {reason}")]
    InvalidChildren { node_id: String, reason: String },

    #[error("no plan for plan execution '{0}'")]
    PlanNotFound(String),

    #[error("plan node '{0}' not found")]
    PlanNodeNotFound(String),

    #[error("node execution '{0}' not found")]
    NodeExecutionNotFound(String),

    /// The Task Executor rejected or failed a call.
    #[error("task execution failed: {0}")]
    TaskExecution(#[from] steps::TaskError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    /// Transport error from the queue crate.
    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
}
