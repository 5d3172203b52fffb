//! The executable-step traits: one per execution mode.
//!
//! A step type registers exactly one implementation, wrapped in the closed
//! [`Step`] enum.  The facilitator decides the execution mode; the engine then
//! drives the matching trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    Ambiance, ChildOutcome, ExecutionMode, StepError, StepResponse, StepType, TaskRequest,
    TaskResponse,
};

/// Context passed to every step hook.
///
/// Defined here (in the steps crate) so both the engine and individual step
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Ambiance of the running node; its current level is the node itself.
    pub ambiance: Ambiance,
    pub node_execution_id: String,
    pub plan_node_id: String,
    pub identifier: String,
    pub step_type: StepType,
}

/// `SYNC`: run in-line and return the final response.
#[async_trait]
pub trait SyncExecutable: Send + Sync {
    async fn execute_sync(&self, ctx: &StepContext, params: &Value)
        -> Result<StepResponse, StepError>;
}

/// `ASYNC`: start external work and wait for every returned callback id.
#[async_trait]
pub trait AsyncExecutable: Send + Sync {
    /// Returns the callback ids the node waits on.
    async fn execute_async(&self, ctx: &StepContext, params: &Value)
        -> Result<Vec<String>, StepError>;

    fn handle_async_response(
        &self,
        ctx: &StepContext,
        params: &Value,
        responses: &BTreeMap<String, Value>,
    ) -> Result<StepResponse, StepError>;
}

/// `TASK`: hand one task to the Task Executor and wait for its callback.
pub trait TaskExecutable: Send + Sync {
    fn obtain_task(&self, ctx: &StepContext, params: &Value) -> Result<TaskRequest, StepError>;

    fn handle_task_result(
        &self,
        ctx: &StepContext,
        params: &Value,
        response: TaskResponse,
    ) -> Result<StepResponse, StepError>;
}

/// `TASK_CHAIN`: run tasks one after another through the synchronous
/// executor contract, stopping at the first unsuccessful one.
pub trait TaskChainExecutable: Send + Sync {
    fn obtain_tasks(&self, ctx: &StepContext, params: &Value)
        -> Result<Vec<TaskRequest>, StepError>;

    fn handle_chain_result(
        &self,
        ctx: &StepContext,
        params: &Value,
        responses: Vec<TaskResponse>,
    ) -> Result<StepResponse, StepError>;
}

/// `CHILD`: run one child chain and derive the response from its end.
pub trait ChildExecutable: Send + Sync {
    /// Plan node id of the chain head.
    fn obtain_child(&self, ctx: &StepContext, params: &Value) -> Result<String, StepError>;

    fn handle_child_response(
        &self,
        ctx: &StepContext,
        params: &Value,
        response: &ChildOutcome,
    ) -> Result<StepResponse, StepError>;
}

/// `CHILDREN`: fan out to two or more concurrent children and join.
pub trait ChildrenExecutable: Send + Sync {
    /// Plan node ids of the children; at least two.
    fn obtain_children(&self, ctx: &StepContext, params: &Value)
        -> Result<Vec<String>, StepError>;

    /// Called once, after every child chain has ended.  Keys are the
    /// correlation ids of the children.
    fn handle_children_response(
        &self,
        ctx: &StepContext,
        params: &Value,
        responses: &BTreeMap<String, ChildOutcome>,
    ) -> Result<StepResponse, StepError>;
}

/// A registered step implementation.
#[derive(Clone)]
pub enum Step {
    Sync(Arc<dyn SyncExecutable>),
    Async(Arc<dyn AsyncExecutable>),
    Task(Arc<dyn TaskExecutable>),
    TaskChain(Arc<dyn TaskChainExecutable>),
    Child(Arc<dyn ChildExecutable>),
    Children(Arc<dyn ChildrenExecutable>),
}

impl Step {
    /// The execution mode this implementation serves.
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Sync(_) => ExecutionMode::Sync,
            Self::Async(_) => ExecutionMode::Async,
            Self::Task(_) => ExecutionMode::Task,
            Self::TaskChain(_) => ExecutionMode::TaskChain,
            Self::Child(_) => ExecutionMode::Child,
            Self::Children(_) => ExecutionMode::Children,
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Step({})", self.mode())
    }
}
