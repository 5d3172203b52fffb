//! The external Task Executor contract and the generic task-backed step.
//!
//! The engine never runs remote work itself.  A step in `TASK` mode produces
//! a [`TaskRequest`]; the engine queues it on a [`TaskExecutor`] together with
//! a [`TaskCallback`], and the executor answers later through that callback.
//! `TASK_CHAIN` steps use the synchronous [`TaskExecutor::execute`] call.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    FailureInfo, Status, StepContext, StepError, StepResponse, TaskError, TaskExecutable,
};

/// Timeout applied when a step's parameters do not name one.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    pub parameters: Value,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub status: Status,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
}

impl TaskResponse {
    pub fn succeeded(output: Value) -> Self {
        Self {
            status: Status::Succeeded,
            output,
            failure_info: None,
        }
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            output: Value::Null,
            failure_info: Some(failure_info),
        }
    }
}

/// An inbound task result, addressed by the callback id it was queued with.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNotification {
    pub callback_id: String,
    pub response: TaskResponse,
}

/// Handle an executor uses to answer a queued task exactly once.
#[derive(Debug, Clone)]
pub struct TaskCallback {
    callback_id: String,
    sender: mpsc::UnboundedSender<TaskNotification>,
}

impl TaskCallback {
    pub fn new(callback_id: impl Into<String>, sender: mpsc::UnboundedSender<TaskNotification>) -> Self {
        Self {
            callback_id: callback_id.into(),
            sender,
        }
    }

    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    /// Deliver the task's result.  Returns `false` if the engine is gone.
    pub fn respond(&self, response: TaskResponse) -> bool {
        let delivered = self
            .sender
            .send(TaskNotification {
                callback_id: self.callback_id.clone(),
                response,
            })
            .is_ok();
        if !delivered {
            warn!("task callback '{}' dropped: receiver closed", self.callback_id);
        }
        delivered
    }
}

/// Black-box executor of remote work.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run a task and wait for its result.
    async fn execute(&self, request: TaskRequest) -> Result<TaskResponse, TaskError>;

    /// Dispatch a task; its result arrives later through `callback`.
    /// Returns the executor's task id.
    async fn queue_task(&self, request: TaskRequest, callback: TaskCallback)
        -> Result<String, TaskError>;

    /// Cancel a queued task.  Returns whether anything was cancelled.
    async fn cancel(&self, task_id: &str) -> Result<bool, TaskError>;
}

// ---------------------------------------------------------------------------
// TaskStep
// ---------------------------------------------------------------------------

/// Generic `TASK` step: forwards its parameters to the executor as a task of
/// the step's own type and turns the task result into the step response.
///
/// The task output is published as the `output` outcome.  A numeric
/// `timeout` parameter (seconds) overrides [`DEFAULT_TASK_TIMEOUT`].
#[derive(Debug, Default, Clone)]
pub struct TaskStep;

impl TaskExecutable for TaskStep {
    fn obtain_task(&self, ctx: &StepContext, params: &Value) -> Result<TaskRequest, StepError> {
        let timeout = match params.get("timeout") {
            None | Some(Value::Null) => DEFAULT_TASK_TIMEOUT,
            Some(v) => v.as_u64().map(Duration::from_secs).ok_or_else(|| {
                StepError::InvalidParameters(format!("timeout must be seconds, got {v}"))
            })?,
        };
        Ok(TaskRequest {
            task_type: ctx.step_type.kind.clone(),
            parameters: params.clone(),
            timeout,
        })
    }

    fn handle_task_result(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        response: TaskResponse,
    ) -> Result<StepResponse, StepError> {
        let mut step_response = StepResponse::with_status(response.status);
        step_response.failure_info = response.failure_info;
        if !response.output.is_null() {
            step_response = step_response.with_outcome("output", response.output);
        }
        Ok(step_response)
    }
}
