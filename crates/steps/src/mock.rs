//! Test doubles: `MockStep`, `MockAsyncStep`, `MockTaskChainStep` and
//! `MockTaskExecutor`.
//!
//! Useful in unit and integration tests where a real step implementation or
//! a real executor is either unavailable or irrelevant.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    AsyncExecutable, FailureInfo, FailureType, Status, StepContext, StepError, StepResponse,
    SyncExecutable, TaskCallback, TaskChainExecutable, TaskError, TaskExecutor, TaskRequest,
    TaskResponse,
};

// ---------------------------------------------------------------------------
// MockStep
// ---------------------------------------------------------------------------

/// Behaviour injected into `MockStep` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return this response.
    Respond(StepResponse),
    /// Fail the hook itself (the engine turns this into `ERRORED`).
    Error(String),
}

/// A sync step that records every call and replays scripted behaviours.
///
/// Behaviours are consumed in order; the last one repeats forever.
pub struct MockStep {
    pub name: String,
    script: Mutex<VecDeque<MockBehaviour>>,
    /// Contexts seen by this step (in call order).
    pub calls: Arc<Mutex<Vec<StepContext>>>,
    delay: Option<Duration>,
}

impl MockStep {
    pub fn scripted(name: impl Into<String>, script: Vec<MockBehaviour>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// Always succeed, publishing `{ "step": name }` as the `output` outcome.
    pub fn succeeding(name: impl Into<String>) -> Self {
        let name = name.into();
        let response =
            StepResponse::succeeded().with_outcome("output", serde_json::json!({ "step": name }));
        Self::scripted(name, vec![MockBehaviour::Respond(response)])
    }

    pub fn responding(name: impl Into<String>, response: StepResponse) -> Self {
        Self::scripted(name, vec![MockBehaviour::Respond(response)])
    }

    /// Always fail with one typed failure.
    pub fn failing(name: impl Into<String>, failure_type: FailureType, msg: impl Into<String>) -> Self {
        let info = FailureInfo::new(msg).with_type(failure_type);
        Self::scripted(name, vec![MockBehaviour::Respond(StepResponse::failed(info))])
    }

    /// Fail `failures` times with `failure_type`, then succeed.
    pub fn flaky(name: impl Into<String>, failures: usize, failure_type: FailureType) -> Self {
        let name = name.into();
        let mut script: Vec<MockBehaviour> = (0..failures)
            .map(|n| {
                let info = FailureInfo::new(format!("{name} attempt {n} failed")).with_type(failure_type);
                MockBehaviour::Respond(StepResponse::failed(info))
            })
            .collect();
        script.push(MockBehaviour::Respond(StepResponse::succeeded()));
        Self::scripted(name, script)
    }

    pub fn erroring(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::scripted(name, vec![MockBehaviour::Error(msg.into())])
    }

    /// Sleep before answering; lets tests interleave concurrent branches.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times this step has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_behaviour(&self) -> MockBehaviour {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script
                .front()
                .cloned()
                .unwrap_or(MockBehaviour::Respond(StepResponse::succeeded()))
        }
    }
}

#[async_trait]
impl SyncExecutable for MockStep {
    async fn execute_sync(&self, ctx: &StepContext, _params: &Value) -> Result<StepResponse, StepError> {
        self.calls.lock().unwrap().push(ctx.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.next_behaviour() {
            MockBehaviour::Respond(response) => Ok(response),
            MockBehaviour::Error(msg) => Err(StepError::Other(anyhow::anyhow!(msg))),
        }
    }
}

// ---------------------------------------------------------------------------
// MockAsyncStep
// ---------------------------------------------------------------------------

/// An async step that hands out `callbacks` ids per run,
/// `<node execution id>:<n>`, and succeeds with every answer as its
/// `output` outcome.
pub struct MockAsyncStep {
    pub name: String,
    callbacks: usize,
    /// Callback ids issued so far, in order.
    pub issued: Mutex<Vec<String>>,
    /// Response maps seen by `handle_async_response`.
    pub answered: Mutex<Vec<BTreeMap<String, Value>>>,
}

impl MockAsyncStep {
    pub fn new(name: impl Into<String>, callbacks: usize) -> Self {
        Self {
            name: name.into(),
            callbacks,
            issued: Mutex::new(Vec::new()),
            answered: Mutex::new(Vec::new()),
        }
    }

    pub fn issued_ids(&self) -> Vec<String> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl AsyncExecutable for MockAsyncStep {
    async fn execute_async(&self, ctx: &StepContext, _params: &Value) -> Result<Vec<String>, StepError> {
        let ids: Vec<String> = (0..self.callbacks)
            .map(|n| format!("{}:{n}", ctx.node_execution_id))
            .collect();
        self.issued.lock().unwrap().extend(ids.iter().cloned());
        Ok(ids)
    }

    fn handle_async_response(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        responses: &BTreeMap<String, Value>,
    ) -> Result<StepResponse, StepError> {
        self.answered.lock().unwrap().push(responses.clone());
        let output = serde_json::to_value(responses).map_err(|e| StepError::Other(e.into()))?;
        Ok(StepResponse::succeeded().with_outcome("output", output))
    }
}

// ---------------------------------------------------------------------------
// MockTaskChainStep
// ---------------------------------------------------------------------------

/// A task-chain step issuing `links` tasks of type `<name>-<n>`.
///
/// Succeeds only when every link ran and succeeded; otherwise fails with the
/// failure of the last response.
pub struct MockTaskChainStep {
    pub name: String,
    links: usize,
    /// Number of responses each run handed to `handle_chain_result`.
    pub chain_lengths: Mutex<Vec<usize>>,
}

impl MockTaskChainStep {
    pub fn new(name: impl Into<String>, links: usize) -> Self {
        Self {
            name: name.into(),
            links,
            chain_lengths: Mutex::new(Vec::new()),
        }
    }
}

impl TaskChainExecutable for MockTaskChainStep {
    fn obtain_tasks(&self, _ctx: &StepContext, params: &Value) -> Result<Vec<TaskRequest>, StepError> {
        Ok((0..self.links)
            .map(|n| TaskRequest {
                task_type: format!("{}-{n}", self.name),
                parameters: params.clone(),
                timeout: Duration::from_secs(60),
            })
            .collect())
    }

    fn handle_chain_result(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        responses: Vec<TaskResponse>,
    ) -> Result<StepResponse, StepError> {
        self.chain_lengths.lock().unwrap().push(responses.len());
        let complete = responses.len() == self.links
            && responses.iter().all(|r| r.status == Status::Succeeded);
        if complete {
            return Ok(StepResponse::succeeded());
        }
        let failure = responses
            .last()
            .and_then(|r| r.failure_info.clone())
            .unwrap_or_else(|| FailureInfo::new(format!("{} chain incomplete", self.name)));
        Ok(StepResponse::failed(failure))
    }
}

// ---------------------------------------------------------------------------
// MockTaskExecutor
// ---------------------------------------------------------------------------

/// A queued task as seen by the mock.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: String,
    pub request: TaskRequest,
    pub callback: TaskCallback,
}

/// Task executor double.
///
/// `execute` replays scripted responses (defaulting to success).  Queued tasks
/// are recorded; with [`MockTaskExecutor::auto_responding`] every queued task
/// is answered immediately through its callback.
#[derive(Default)]
pub struct MockTaskExecutor {
    sync_script: Mutex<VecDeque<TaskResponse>>,
    auto_response: Option<TaskResponse>,
    pub queued: Mutex<Vec<QueuedTask>>,
    pub executed: Mutex<Vec<TaskRequest>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl MockTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_responding(response: TaskResponse) -> Self {
        Self {
            auto_response: Some(response),
            ..Self::default()
        }
    }

    pub fn with_sync_responses(self, responses: Vec<TaskResponse>) -> Self {
        *self.sync_script.lock().unwrap() = responses.into();
        self
    }

    pub fn queued_count(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    pub fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Answer the `index`-th queued task.  Returns `false` if there is none.
    pub fn respond(&self, index: usize, response: TaskResponse) -> bool {
        let callback = self
            .queued
            .lock()
            .unwrap()
            .get(index)
            .map(|q| q.callback.clone());
        callback.map(|cb| cb.respond(response)).unwrap_or(false)
    }
}

#[async_trait]
impl TaskExecutor for MockTaskExecutor {
    async fn execute(&self, request: TaskRequest) -> Result<TaskResponse, TaskError> {
        self.executed.lock().unwrap().push(request);
        Ok(self
            .sync_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TaskResponse::succeeded(Value::Null)))
    }

    async fn queue_task(&self, request: TaskRequest, callback: TaskCallback) -> Result<String, TaskError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        if let Some(response) = &self.auto_response {
            callback.respond(response.clone());
        }
        self.queued.lock().unwrap().push(QueuedTask {
            task_id: task_id.clone(),
            request,
            callback,
        });
        Ok(task_id)
    }

    async fn cancel(&self, task_id: &str) -> Result<bool, TaskError> {
        let known = self.queued.lock().unwrap().iter().any(|q| q.task_id == task_id);
        if known {
            self.cancelled.lock().unwrap().push(task_id.to_owned());
        }
        Ok(known)
    }
}
