//! The orchestration engine.
//!
//! `OrchestrationEngine` drives every node execution of a plan:
//! 1. Instantiates a plan node as a `QUEUED` node execution.
//! 2. Asks the facilitator how it runs, then moves it to `RUNNING`.
//! 3. Dispatches it by execution mode: in-line, through the Task Executor,
//!    or by starting children and waiting on them.
//! 4. On the step response, stores outcomes, sets the final status and asks
//!    the node's advisers what happens next.
//! 5. Ends the chain by notifying the parent (or concluding the plan).
//!
//! Every status write goes through the conditional update in
//! `db::repository::node_executions::update_status`; a lost race returns
//! `Ok(None)` and the caller stops.  Work is driven by spawned tasks, so a
//! waiting node occupies no task at all.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use db::models::{NodeExecution, PlanExecution};
use db::repository::{node_executions, plan_executions};
use db::DbPool;
use queue::EventLog;
use steps::{
    Ambiance, ChildOutcome, ExecutionMode, FailureInfo, FailureType, ForkStep, Level, ResponseData,
    SectionStep, Status, Step, StepContext, StepError, StepResponse, TaskCallback, TaskExecutor,
    TaskNotification, TaskResponse,
};

use crate::advisers::{AdviserRegistry, AdviserResponse};
use crate::dag::validate_plan;
use crate::events::{EventBus, EventBusBuilder, OrchestrationEvent, OrchestrationEventType};
use crate::facilitator::{Facilitator, FacilitatorRegistry, FacilitatorResponse, StaticFacilitator};
use crate::models::{Plan, PlanNode};
use crate::outcomes::OutcomeService;
use crate::plan_creation::creators::{FORK_KIND, PIPELINE_KIND, STAGES_KIND, STAGE_KIND, STEPS_KIND};
use crate::summary::{ExecutionSummaryUpdater, ModuleInfoProvider};
use crate::waiter::WaitNotifyRegistry;
use crate::{EngineConfig, EngineError};

/// Maps a step kind to its implementation.
pub type StepRegistry = HashMap<String, Step>;

/// Name of the interrupt stream created when none is supplied.
pub const INTERRUPT_LOG: &str = "orchestration-interrupts";

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct EngineBuilder {
    pool: DbPool,
    task_executor: Arc<dyn TaskExecutor>,
    config: EngineConfig,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    events: EventBusBuilder,
    module_info_providers: Vec<Arc<dyn ModuleInfoProvider>>,
    interrupt_log: Option<Arc<EventLog>>,
}

impl EngineBuilder {
    pub fn new(pool: DbPool, task_executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            pool,
            task_executor,
            config: EngineConfig::default(),
            steps: StepRegistry::new(),
            facilitators: FacilitatorRegistry::new(),
            advisers: AdviserRegistry::with_defaults(),
            events: EventBusBuilder::new(),
            module_info_providers: Vec::new(),
            interrupt_log: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register_step(mut self, kind: impl Into<String>, step: Step) -> Self {
        self.steps.insert(kind.into(), step);
        self
    }

    pub fn register_facilitator(mut self, kind: impl Into<String>, facilitator: Arc<dyn Facilitator>) -> Self {
        self.facilitators.register(kind, facilitator);
        self
    }

    pub fn advisers(mut self, advisers: AdviserRegistry) -> Self {
        self.advisers = advisers;
        self
    }

    pub fn events(mut self, events: EventBusBuilder) -> Self {
        self.events = events;
        self
    }

    pub fn module_info_provider(mut self, provider: Arc<dyn ModuleInfoProvider>) -> Self {
        self.module_info_providers.push(provider);
        self
    }

    pub fn interrupt_log(mut self, log: Arc<EventLog>) -> Self {
        self.interrupt_log = Some(log);
        self
    }

    /// Must be called inside a Tokio runtime: the task-callback loop and the
    /// async event workers start here.
    pub fn build(mut self) -> OrchestrationEngine {
        for kind in [PIPELINE_KIND, STAGES_KIND, STAGE_KIND, STEPS_KIND] {
            self.steps
                .entry(kind.to_owned())
                .or_insert_with(|| Step::Child(Arc::new(SectionStep)));
        }
        self.steps
            .entry(FORK_KIND.to_owned())
            .or_insert_with(|| Step::Children(Arc::new(ForkStep)));

        for (kind, step) in &self.steps {
            if !self.facilitators.contains(kind) {
                self.facilitators.register(
                    kind.clone(),
                    Arc::new(StaticFacilitator::new(step.mode(), self.config.default_task_timeout)),
                );
            }
        }

        let (task_sender, task_receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            summary: ExecutionSummaryUpdater::new(self.pool.clone(), self.module_info_providers),
            outcomes: OutcomeService::new(self.pool.clone()),
            pool: self.pool,
            task_executor: self.task_executor,
            config: self.config,
            steps: self.steps,
            facilitators: self.facilitators,
            advisers: self.advisers,
            events: self.events.build(),
            waiter: WaitNotifyRegistry::new(),
            executions: RwLock::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
            task_sender,
            interrupt_log: self
                .interrupt_log
                .unwrap_or_else(|| Arc::new(EventLog::new(INTERRUPT_LOG))),
        });
        spawn_callback_loop(Arc::downgrade(&inner), task_receiver);
        OrchestrationEngine { inner }
    }
}

/// Feeds Task Executor callbacks into wait/notify.  Holds only a weak
/// reference so dropping the engine ends the loop.
fn spawn_callback_loop(inner: Weak<EngineInner>, mut receiver: mpsc::UnboundedReceiver<TaskNotification>) {
    tokio::spawn(async move {
        while let Some(notification) = receiver.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            let engine = OrchestrationEngine { inner };
            engine
                .notify_callback(&notification.callback_id, ResponseData::Task(notification.response))
                .await;
        }
        debug!("task callback loop stopped");
    });
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct ExecutionEntry {
    plan: Arc<Plan>,
    /// Root ambiance, without levels.
    ambiance: Ambiance,
    completion: watch::Sender<Option<Status>>,
}

pub(crate) struct EngineInner {
    pub(crate) pool: DbPool,
    pub(crate) task_executor: Arc<dyn TaskExecutor>,
    pub(crate) config: EngineConfig,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    pub(crate) events: EventBus,
    summary: ExecutionSummaryUpdater,
    outcomes: OutcomeService,
    pub(crate) waiter: WaitNotifyRegistry,
    executions: RwLock<HashMap<String, ExecutionEntry>>,
    /// Responses that arrived while their node was suspended.
    pub(crate) parked: Mutex<HashMap<String, BTreeMap<String, ResponseData>>>,
    task_sender: mpsc::UnboundedSender<TaskNotification>,
    pub(crate) interrupt_log: Arc<EventLog>,
}

/// Cheap to clone; every clone drives the same executions.
#[derive(Clone)]
pub struct OrchestrationEngine {
    pub(crate) inner: Arc<EngineInner>,
}

/// Linkage of a node execution about to be created.
#[derive(Debug, Default)]
struct TriggerContext {
    /// Ambiance the new level is pushed onto.
    ambiance: Ambiance,
    parent_id: Option<String>,
    previous_id: Option<String>,
    notify_id: Option<String>,
    retry_ids: Vec<String>,
}

fn errored(err: &StepError) -> StepResponse {
    StepResponse::errored(err.failure_info())
}

impl OrchestrationEngine {
    pub fn builder(pool: DbPool, task_executor: Arc<dyn TaskExecutor>) -> EngineBuilder {
        EngineBuilder::new(pool, task_executor)
    }

    pub fn pool(&self) -> &DbPool {
        &self.inner.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn outcomes(&self) -> &OutcomeService {
        &self.inner.outcomes
    }

    pub fn interrupt_log(&self) -> &Arc<EventLog> {
        &self.inner.interrupt_log
    }

    pub async fn plan(&self, plan_execution_id: &str) -> Result<Arc<Plan>, EngineError> {
        self.inner
            .executions
            .read()
            .await
            .get(plan_execution_id)
            .map(|entry| entry.plan.clone())
            .ok_or_else(|| EngineError::PlanNotFound(plan_execution_id.to_owned()))
    }

    // -----------------------------------------------------------------------
    // Plan lifecycle
    // -----------------------------------------------------------------------

    /// Start executing `plan` and return the plan execution id.  The plan
    /// runs in the background; see [`OrchestrationEngine::await_completion`].
    #[instrument(skip(self, plan, setup_abstractions), fields(plan_id = %plan.uuid))]
    pub async fn start_execution(
        &self,
        plan: Plan,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Result<String, EngineError> {
        validate_plan(&plan)?;
        let plan = Arc::new(plan);
        let plan_execution_id = uuid::Uuid::new_v4().to_string();
        let ambiance = Ambiance::new(plan_execution_id.clone(), plan.uuid.clone(), setup_abstractions);
        let starting = plan
            .starting_node()
            .ok_or_else(|| EngineError::PlanNodeNotFound(plan.starting_node_id.clone()))?;

        plan_executions::insert_plan_execution(
            &self.inner.pool,
            PlanExecution::running(plan_execution_id.clone(), plan.uuid.clone()),
        )
        .await?;
        let (completion, _) = watch::channel(None);
        self.inner.executions.write().await.insert(
            plan_execution_id.clone(),
            ExecutionEntry {
                plan: plan.clone(),
                ambiance: ambiance.clone(),
                completion,
            },
        );

        if let Err(e) = self.inner.summary.create_initial(&plan_execution_id, &plan).await {
            warn!("summary for plan execution {} not created: {}", plan_execution_id, e);
        }
        self.inner
            .events
            .publish(OrchestrationEvent::for_plan(
                OrchestrationEventType::OrchestrationStart,
                ambiance.clone(),
                Status::Running,
            ))
            .await;

        info!("plan execution {} started", plan_execution_id);
        self.trigger_node(
            starting,
            TriggerContext {
                ambiance,
                ..TriggerContext::default()
            },
        )
        .await?;
        Ok(plan_execution_id)
    }

    /// Wait until the plan execution concluded and return its status.
    pub async fn await_completion(&self, plan_execution_id: &str) -> Result<Status, EngineError> {
        let mut receiver = self
            .inner
            .executions
            .read()
            .await
            .get(plan_execution_id)
            .map(|entry| entry.completion.subscribe())
            .ok_or_else(|| EngineError::PlanNotFound(plan_execution_id.to_owned()))?;
        loop {
            if let Some(status) = *receiver.borrow_and_update() {
                return Ok(status);
            }
            if receiver.changed().await.is_err() {
                return Ok(plan_executions::get_plan_execution(&self.inner.pool, plan_execution_id)
                    .await?
                    .status);
            }
        }
    }

    /// Deliver an external callback (task result, async response).
    pub async fn notify_callback(&self, correlation_id: &str, data: ResponseData) {
        if let Some((waiter_id, responses)) = self.inner.waiter.notify(correlation_id, data).await {
            self.spawn_resume(waiter_id, responses);
        }
    }

    // -----------------------------------------------------------------------
    // Spawning
    // -----------------------------------------------------------------------

    fn spawn_run_node(&self, node_execution_id: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_node(&node_execution_id).await {
                error!("node execution {} failed to run: {}", node_execution_id, e);
            }
        });
    }

    pub(crate) fn spawn_resume(&self, node_execution_id: String, responses: BTreeMap<String, ResponseData>) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.resume_node(&node_execution_id, responses).await {
                error!("node execution {} failed to resume: {}", node_execution_id, e);
            }
        });
    }

    // -----------------------------------------------------------------------
    // Node lifecycle
    // -----------------------------------------------------------------------

    async fn trigger_node(&self, plan_node: &PlanNode, ctx: TriggerContext) -> Result<String, EngineError> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let level = Level {
            setup_id: plan_node.uuid.clone(),
            runtime_id: uuid.clone(),
            identifier: plan_node.identifier.clone(),
            step_type: plan_node.step_type.clone(),
            group: plan_node.group.clone(),
            start_ts: Utc::now().timestamp_millis(),
        };
        let mut node_execution = NodeExecution::queued(
            uuid.clone(),
            ctx.ambiance.clone_for_child(level),
            plan_node.uuid.clone(),
            plan_node.identifier.clone(),
            plan_node.step_type.clone(),
        );
        node_execution.parent_id = ctx.parent_id;
        node_execution.previous_id = ctx.previous_id;
        node_execution.notify_id = ctx.notify_id;
        node_execution.retry_ids = ctx.retry_ids;

        node_executions::insert_node_execution(&self.inner.pool, node_execution).await?;
        debug!("node execution {} queued for '{}'", uuid, plan_node.identifier);
        self.spawn_run_node(uuid.clone());
        Ok(uuid)
    }

    async fn plan_node_of(&self, node_execution: &NodeExecution) -> Result<(Arc<Plan>, String), EngineError> {
        let plan = self.plan(node_execution.plan_execution_id()).await?;
        if plan.node(&node_execution.node_id).is_none() {
            return Err(EngineError::PlanNodeNotFound(node_execution.node_id.clone()));
        }
        Ok((plan, node_execution.node_id.clone()))
    }

    fn facilitate(&self, node_execution: &NodeExecution, plan_node: &PlanNode) -> Result<(FacilitatorResponse, Step), EngineError> {
        let step = self
            .inner
            .steps
            .get(&plan_node.step_type.kind)
            .cloned()
            .ok_or_else(|| EngineError::StepNotRegistered(plan_node.step_type.kind.clone()))?;
        let facilitated = self.inner.facilitators.facilitate(&node_execution.ambiance, plan_node)?;
        if facilitated.mode != step.mode() {
            return Err(EngineError::ModeMismatch {
                step_type: plan_node.step_type.kind.clone(),
                facilitated: facilitated.mode,
                implemented: step.mode(),
            });
        }
        Ok((facilitated, step))
    }

    #[instrument(skip(self))]
    async fn run_node(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let node_execution = node_executions::get_node_execution(&self.inner.pool, node_execution_id).await?;
        if node_execution.status != Status::Queued {
            debug!("node execution {} already {}", node_execution_id, node_execution.status);
            return Ok(());
        }
        let (plan, node_id) = self.plan_node_of(&node_execution).await?;
        let plan_node = plan
            .node(&node_id)
            .ok_or_else(|| EngineError::PlanNodeNotFound(node_id.clone()))?;

        if self.chain_halted(&node_execution).await? {
            return self.abort_unstarted(&node_execution, plan_node).await;
        }

        let (facilitated, step) = match self.facilitate(&node_execution, plan_node) {
            Ok(ok) => ok,
            Err(e) => {
                warn!("node execution {} cannot start: {}", node_execution_id, e);
                return self.fail_unstarted(&node_execution, plan_node, e).await;
            }
        };

        let now = Utc::now();
        let expiry_ts = facilitated
            .timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .and_then(|d| now.checked_add_signed(d));
        let Some(running) = node_executions::update_status(
            &self.inner.pool,
            node_execution_id,
            Status::Running,
            &[Status::Queued],
            |ne| {
                ne.start_ts = Some(now);
                ne.mode = Some(facilitated.mode);
                ne.expiry_ts = expiry_ts;
                ne.resolved_step_parameters = plan_node.step_parameters.clone();
            },
        )
        .await?
        else {
            return Ok(());
        };

        self.inner
            .events
            .publish(OrchestrationEvent::for_node(OrchestrationEventType::NodeExecutionStart, &running))
            .await;
        self.on_status_change(&running, plan_node).await;

        let ctx = StepContext {
            ambiance: running.ambiance.clone(),
            node_execution_id: running.uuid.clone(),
            plan_node_id: plan_node.uuid.clone(),
            identifier: plan_node.identifier.clone(),
            step_type: plan_node.step_type.clone(),
        };
        let params = &plan_node.step_parameters;

        match step {
            Step::Sync(step) => {
                let response = step.execute_sync(&ctx, params).await.unwrap_or_else(|e| errored(&e));
                self.handle_step_response(&running, response).await
            }
            Step::Async(step) => match step.execute_async(&ctx, params).await {
                Ok(callback_ids) => self.wait_on(&running, callback_ids).await,
                Err(e) => self.handle_step_response(&running, errored(&e)).await,
            },
            Step::Task(step) => match step.obtain_task(&ctx, params) {
                Ok(request) => {
                    let callback_id = uuid::Uuid::new_v4().to_string();
                    self.wait_on(&running, vec![callback_id.clone()]).await?;
                    let callback = TaskCallback::new(callback_id, self.inner.task_sender.clone());
                    match self.inner.task_executor.queue_task(request, callback).await {
                        Ok(task_id) => {
                            node_executions::update(&self.inner.pool, node_execution_id, |ne| {
                                ne.task_id = Some(task_id)
                            })
                            .await?;
                            Ok(())
                        }
                        Err(e) => {
                            self.inner.waiter.cancel(node_execution_id).await;
                            self.handle_step_response(&running, errored(&StepError::Task(e))).await
                        }
                    }
                }
                Err(e) => self.handle_step_response(&running, errored(&e)).await,
            },
            Step::TaskChain(step) => {
                let response = match step.obtain_tasks(&ctx, params) {
                    Ok(requests) => {
                        let mut responses = Vec::with_capacity(requests.len());
                        for request in requests {
                            let response = match self.inner.task_executor.execute(request).await {
                                Ok(response) => response,
                                Err(e) => TaskResponse::failed(StepError::Task(e).failure_info()),
                            };
                            let succeeded = response.status == Status::Succeeded;
                            responses.push(response);
                            if !succeeded {
                                break;
                            }
                        }
                        step.handle_chain_result(&ctx, params, responses)
                            .unwrap_or_else(|e| errored(&e))
                    }
                    Err(e) => errored(&e),
                };
                self.handle_step_response(&running, response).await
            }
            Step::Child(step) => match step.obtain_child(&ctx, params) {
                Ok(child) => self.start_children(&running, &plan, vec![child]).await,
                Err(e) => self.handle_step_response(&running, errored(&e)).await,
            },
            Step::Children(step) => match step.obtain_children(&ctx, params) {
                Ok(children) => self.start_children(&running, &plan, children).await,
                Err(e) => self.handle_step_response(&running, errored(&e)).await,
            },
        }
    }

    /// Register the correlation ids `node_execution` waits on.
    async fn wait_on(&self, node_execution: &NodeExecution, correlation_ids: Vec<String>) -> Result<(), EngineError> {
        node_executions::update(&self.inner.pool, &node_execution.uuid, |ne| {
            ne.correlation_ids = correlation_ids.clone()
        })
        .await?;
        if let Some((waiter_id, responses)) =
            self.inner.waiter.register(&node_execution.uuid, &correlation_ids).await
        {
            self.spawn_resume(waiter_id, responses);
        }
        Ok(())
    }

    /// Start one child chain per plan node id.  The parent waits before any
    /// child exists, so no completion can be missed.
    async fn start_children(
        &self,
        parent: &NodeExecution,
        plan: &Plan,
        children: Vec<String>,
    ) -> Result<(), EngineError> {
        let mut child_nodes = Vec::with_capacity(children.len());
        for child in &children {
            match plan.node(child) {
                Some(node) => child_nodes.push(node),
                None => {
                    let err = EngineError::InvalidChildren {
                        node_id: parent.node_id.clone(),
                        reason: format!("unknown plan node '{child}'"),
                    };
                    let response = StepResponse::errored(FailureInfo::new(err.to_string()));
                    return self.handle_step_response(parent, response).await;
                }
            }
        }

        let correlation_ids: Vec<String> = child_nodes
            .iter()
            .map(|_| uuid::Uuid::new_v4().to_string())
            .collect();
        self.wait_on(parent, correlation_ids.clone()).await?;

        for (child, notify_id) in child_nodes.into_iter().zip(correlation_ids) {
            self.trigger_node(
                child,
                TriggerContext {
                    ambiance: parent.ambiance.clone(),
                    parent_id: Some(parent.uuid.clone()),
                    notify_id: Some(notify_id),
                    ..TriggerContext::default()
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Continue a waiting node once every response it waited on arrived.
    #[instrument(skip(self, responses))]
    pub(crate) async fn resume_node(
        &self,
        node_execution_id: &str,
        responses: BTreeMap<String, ResponseData>,
    ) -> Result<(), EngineError> {
        let mut parked = self.inner.parked.lock().await;
        let node_execution = node_executions::get_node_execution(&self.inner.pool, node_execution_id).await?;
        match node_execution.status {
            Status::Suspended => {
                debug!("node execution {} suspended; parking responses", node_execution_id);
                parked.insert(node_execution_id.to_owned(), responses);
                return Ok(());
            }
            Status::Discontinuing => {
                drop(parked);
                return self.finish_abort(&node_execution).await;
            }
            Status::Running => {}
            other => {
                debug!("node execution {} is {}; responses dropped", node_execution_id, other);
                return Ok(());
            }
        }
        drop(parked);

        let (plan, node_id) = self.plan_node_of(&node_execution).await?;
        let plan_node = plan
            .node(&node_id)
            .ok_or_else(|| EngineError::PlanNodeNotFound(node_id.clone()))?;
        let step = self
            .inner
            .steps
            .get(&plan_node.step_type.kind)
            .ok_or_else(|| EngineError::StepNotRegistered(plan_node.step_type.kind.clone()))?;
        let ctx = StepContext {
            ambiance: node_execution.ambiance.clone(),
            node_execution_id: node_execution.uuid.clone(),
            plan_node_id: plan_node.uuid.clone(),
            identifier: plan_node.identifier.clone(),
            step_type: plan_node.step_type.clone(),
        };
        let params = &plan_node.step_parameters;

        let unexpected = |what: &str| {
            StepResponse::errored(FailureInfo::new(format!(
                "node execution {node_execution_id} received an unexpected {what}"
            )))
        };
        let response = match step {
            Step::Async(step) => {
                let values: BTreeMap<String, Value> = responses
                    .into_iter()
                    .map(|(id, data)| {
                        let value = match data {
                            ResponseData::Callback(value) => value,
                            other => serde_json::to_value(other).unwrap_or(Value::Null),
                        };
                        (id, value)
                    })
                    .collect();
                step.handle_async_response(&ctx, params, &values)
                    .unwrap_or_else(|e| errored(&e))
            }
            Step::Task(step) => match responses.into_values().next() {
                Some(ResponseData::Task(task)) => step
                    .handle_task_result(&ctx, params, task)
                    .unwrap_or_else(|e| errored(&e)),
                _ => unexpected("response for a task"),
            },
            Step::Child(step) => match responses.values().next() {
                Some(ResponseData::Child(child)) => step
                    .handle_child_response(&ctx, params, child)
                    .unwrap_or_else(|e| errored(&e)),
                _ => unexpected("response for a child"),
            },
            Step::Children(step) => {
                let children: BTreeMap<String, ChildOutcome> = responses
                    .into_iter()
                    .filter_map(|(id, data)| match data {
                        ResponseData::Child(child) => Some((id, child)),
                        _ => None,
                    })
                    .collect();
                step.handle_children_response(&ctx, params, &children)
                    .unwrap_or_else(|e| errored(&e))
            }
            Step::Sync(_) | Step::TaskChain(_) => unexpected("callback"),
        };
        self.handle_step_response(&node_execution, response).await
    }

    /// Finalise a `RUNNING` node with `response` and advise on it.
    pub(crate) async fn handle_step_response(
        &self,
        node_execution: &NodeExecution,
        mut response: StepResponse,
    ) -> Result<(), EngineError> {
        if !response.status.is_final() {
            warn!(
                "node execution {} answered non-final status {}",
                node_execution.uuid, response.status
            );
            response.failure_info.get_or_insert_with(|| {
                FailureInfo::new(format!("step answered non-final status {}", response.status))
                    .with_type(FailureType::UnknownFailure)
            });
            response.status = Status::Errored;
        }

        let Some(mut finished) = node_executions::update_status(
            &self.inner.pool,
            &node_execution.uuid,
            response.status,
            &[Status::Running],
            |ne| {
                ne.failure_info = response.failure_info.clone();
                ne.unit_progress = response.unit_progress.clone();
                ne.correlation_ids.clear();
            },
        )
        .await?
        else {
            return Ok(());
        };

        // Only the response that won the transition stores its outcomes.
        match self.inner.outcomes.consume(&finished, &response.outcomes).await {
            Ok(refs) if refs.is_empty() => {}
            Ok(refs) => {
                finished = node_executions::update(&self.inner.pool, &finished.uuid, |ne| {
                    ne.outcome_refs.extend(refs)
                })
                .await?;
            }
            Err(e) => warn!("outcomes of node execution {} not stored: {}", finished.uuid, e),
        }

        let (plan, node_id) = self.plan_node_of(&finished).await?;
        let plan_node = plan
            .node(&node_id)
            .ok_or_else(|| EngineError::PlanNodeNotFound(node_id.clone()))?;
        self.on_status_change(&finished, plan_node).await;

        if plan_node.skip_advise {
            self.end_node_execution(&finished).await
        } else {
            self.advise(&finished, plan_node).await
        }
    }

    pub(crate) async fn on_status_change(&self, node_execution: &NodeExecution, plan_node: &PlanNode) {
        self.inner
            .summary
            .on_node_status_changed(node_execution, plan_node)
            .await;
        self.inner
            .events
            .publish(OrchestrationEvent::for_node(
                OrchestrationEventType::NodeExecutionStatusUpdate,
                node_execution,
            ))
            .await;
    }

    /// Facilitation failed: the node never runs and is handed to its
    /// advisers as `ERRORED`.
    async fn fail_unstarted(
        &self,
        node_execution: &NodeExecution,
        plan_node: &PlanNode,
        err: EngineError,
    ) -> Result<(), EngineError> {
        let failure = FailureInfo::new(err.to_string()).with_type(FailureType::UnknownFailure);
        let Some(failed) = node_executions::update_status(
            &self.inner.pool,
            &node_execution.uuid,
            Status::Errored,
            &[Status::Queued],
            |ne| ne.failure_info = Some(failure),
        )
        .await?
        else {
            return Ok(());
        };
        self.on_status_change(&failed, plan_node).await;
        self.advise(&failed, plan_node).await
    }

    /// The chain was halted before this node started.
    async fn abort_unstarted(&self, node_execution: &NodeExecution, plan_node: &PlanNode) -> Result<(), EngineError> {
        let Some(aborted) = node_executions::update_status(
            &self.inner.pool,
            &node_execution.uuid,
            Status::Aborted,
            &[Status::Queued],
            |_| {},
        )
        .await?
        else {
            return Ok(());
        };
        self.on_status_change(&aborted, plan_node).await;
        self.end_node_execution(&aborted).await
    }

    // -----------------------------------------------------------------------
    // Advising
    // -----------------------------------------------------------------------

    #[instrument(skip(self, node_execution, plan_node), fields(node_execution_id = %node_execution.uuid))]
    async fn advise(&self, node_execution: &NodeExecution, plan_node: &PlanNode) -> Result<(), EngineError> {
        if node_execution.status == Status::Aborted {
            return self.end_node_execution(node_execution).await;
        }

        let response = match self
            .inner
            .advisers
            .advise(node_execution, &plan_node.adviser_obtainments)
        {
            Ok(response) => response,
            Err(e) => {
                error!("advising node execution {} failed: {}", node_execution.uuid, e);
                return self
                    .error_out_plan(
                        node_execution.plan_execution_id(),
                        FailureInfo::new(e.to_string()).with_type(FailureType::UnknownFailure),
                    )
                    .await;
            }
        };
        debug!("node execution {} advised {:?}", node_execution.uuid, response);
        let rendered = format!("{response:?}");
        node_executions::update(&self.inner.pool, &node_execution.uuid, |ne| {
            ne.adviser_response = Some(rendered)
        })
        .await?;

        match response {
            AdviserResponse::NextStep { next_node_id } => self.advance(node_execution, next_node_id).await,
            AdviserResponse::Rollback { rollback_node_id } => {
                self.advance(node_execution, Some(rollback_node_id)).await
            }
            AdviserResponse::MarkFailed => self.end_node_execution(node_execution).await,
            AdviserResponse::IgnoreFailure { next_node_id } => {
                let ignored = node_executions::update(&self.inner.pool, &node_execution.uuid, |ne| {
                    ne.failure_ignored = true
                })
                .await?;
                self.on_status_change(&ignored, plan_node).await;
                self.advance(&ignored, next_node_id).await
            }
            AdviserResponse::EndPlan => self.end_plan(node_execution).await,
            AdviserResponse::Retry { wait } => {
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                if self.chain_halted(node_execution).await? {
                    return self.end_node_execution(node_execution).await;
                }
                node_executions::mark_retried(&self.inner.pool, &node_execution.uuid).await?;
                let mut retry_ids = node_execution.retry_ids.clone();
                retry_ids.push(node_execution.uuid.clone());
                info!(
                    "retrying '{}' (attempt {})",
                    plan_node.identifier,
                    retry_ids.len() + 1
                );
                self.trigger_node(
                    plan_node,
                    TriggerContext {
                        ambiance: node_execution.ambiance.clone_for_finish(),
                        parent_id: node_execution.parent_id.clone(),
                        previous_id: node_execution.previous_id.clone(),
                        notify_id: node_execution.notify_id.clone(),
                        retry_ids,
                    },
                )
                .await
                .map(|_| ())
            }
        }
    }

    /// Hand control to `next_node_id` in the same chain, or end the chain.
    async fn advance(&self, node_execution: &NodeExecution, next_node_id: Option<String>) -> Result<(), EngineError> {
        let Some(next_node_id) = next_node_id else {
            return self.end_node_execution(node_execution).await;
        };
        if self.chain_halted(node_execution).await? {
            return self.end_node_execution(node_execution).await;
        }
        let plan = self.plan(node_execution.plan_execution_id()).await?;
        let next = plan
            .node(&next_node_id)
            .ok_or_else(|| EngineError::PlanNodeNotFound(next_node_id.clone()))?;
        let next_id = self
            .trigger_node(
                next,
                TriggerContext {
                    ambiance: node_execution.ambiance.clone_for_finish(),
                    parent_id: node_execution.parent_id.clone(),
                    previous_id: Some(node_execution.uuid.clone()),
                    notify_id: node_execution.notify_id.clone(),
                    retry_ids: Vec::new(),
                },
            )
            .await?;
        node_executions::update(&self.inner.pool, &node_execution.uuid, |ne| ne.next_id = Some(next_id))
            .await?;
        Ok(())
    }

    /// Whether the chain of `node_execution` must stop: the plan concluded or
    /// is being aborted, or its parent no longer runs.
    async fn chain_halted(&self, node_execution: &NodeExecution) -> Result<bool, EngineError> {
        let plan_execution =
            plan_executions::get_plan_execution(&self.inner.pool, node_execution.plan_execution_id()).await?;
        if plan_execution.status.is_final() || plan_execution.status == Status::Discontinuing {
            return Ok(true);
        }
        let Some(parent_id) = &node_execution.parent_id else {
            return Ok(false);
        };
        let parent = node_executions::get_node_execution(&self.inner.pool, parent_id).await?;
        Ok(parent.status == Status::Discontinuing || parent.status.is_final())
    }

    /// The chain of `node_execution` ended: report to the parent, or
    /// conclude the plan when this is the root chain.
    pub(crate) async fn end_node_execution(&self, node_execution: &NodeExecution) -> Result<(), EngineError> {
        if let Some(notify_id) = &node_execution.notify_id {
            let outcome = ChildOutcome {
                node_execution_id: node_execution.uuid.clone(),
                plan_node_id: node_execution.node_id.clone(),
                identifier: node_execution.identifier.clone(),
                status: node_execution.effective_status(),
                failure_info: node_execution.failure_info.clone(),
                unit_progress: node_execution.unit_progress.clone(),
            };
            self.notify_callback(notify_id, ResponseData::Child(outcome)).await;
            return Ok(());
        }
        if node_execution.parent_id.is_none() {
            self.conclude_plan(
                node_execution.plan_execution_id(),
                node_execution.effective_status(),
                node_execution.failure_info.clone(),
            )
            .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plan conclusion
    // -----------------------------------------------------------------------

    pub(crate) async fn conclude_plan(
        &self,
        plan_execution_id: &str,
        status: Status,
        failure_info: Option<FailureInfo>,
    ) -> Result<(), EngineError> {
        let Some(concluded) = plan_executions::update_plan_status(
            &self.inner.pool,
            plan_execution_id,
            status,
            &[Status::Running, Status::Discontinuing],
            |pe| pe.failure_info = failure_info.clone(),
        )
        .await?
        else {
            return Ok(());
        };

        self.inner
            .summary
            .on_plan_end(plan_execution_id, status, failure_info.as_ref())
            .await;

        let executions = self.inner.executions.read().await;
        if let Some(entry) = executions.get(plan_execution_id) {
            self.inner
                .events
                .publish(OrchestrationEvent::for_plan(
                    OrchestrationEventType::OrchestrationEnd,
                    entry.ambiance.clone(),
                    status,
                ))
                .await;
            entry.completion.send_replace(Some(status));
        }
        info!("plan execution {} concluded {}", concluded.uuid, status);
        Ok(())
    }

    /// Halt the plan, abort everything still active, then conclude with the
    /// node's own status.  Concluding last keeps the node's failure at the
    /// top of the summary.
    async fn end_plan(&self, node_execution: &NodeExecution) -> Result<(), EngineError> {
        let plan_execution_id = node_execution.plan_execution_id().to_owned();
        plan_executions::update_plan_status(
            &self.inner.pool,
            &plan_execution_id,
            Status::Discontinuing,
            &[Status::Running],
            |_| {},
        )
        .await?;

        let plan = self.plan(&plan_execution_id).await?;
        for active in node_executions::fetch_active(&self.inner.pool, &plan_execution_id).await? {
            let Some(aborted) = node_executions::update_status(
                &self.inner.pool,
                &active.uuid,
                Status::Aborted,
                &[],
                |ne| ne.correlation_ids.clear(),
            )
            .await?
            else {
                continue;
            };
            self.release(&aborted).await;
            self.inner.parked.lock().await.remove(&aborted.uuid);
            if let Some(plan_node) = plan.node(&aborted.node_id) {
                self.on_status_change(&aborted, plan_node).await;
            }
        }

        self.conclude_plan(
            &plan_execution_id,
            node_execution.effective_status(),
            node_execution.failure_info.clone(),
        )
        .await
    }

    /// Every active node becomes `ERRORED` and the plan concludes `ERRORED`.
    pub(crate) async fn error_out_plan(&self, plan_execution_id: &str, failure: FailureInfo) -> Result<(), EngineError> {
        let active = node_executions::fetch_active(&self.inner.pool, plan_execution_id).await?;
        node_executions::error_out_active_nodes(&self.inner.pool, plan_execution_id).await?;
        for node_execution in &active {
            self.release(node_execution).await;
        }
        self.conclude_plan(plan_execution_id, Status::Errored, Some(failure)).await
    }

    /// Drop the wait and cancel the task of a node that will never resume.
    pub(crate) async fn release(&self, node_execution: &NodeExecution) {
        self.inner.waiter.cancel(&node_execution.uuid).await;
        if let Some(task_id) = &node_execution.task_id {
            match self.inner.task_executor.cancel(task_id).await {
                Ok(true) => debug!("task {} cancelled", task_id),
                Ok(false) => debug!("task {} was not running", task_id),
                Err(e) => warn!("cancelling task {} failed: {}", task_id, e),
            }
        }
    }

    /// A `DISCONTINUING` parent whose children all ended becomes `ABORTED`.
    async fn finish_abort(&self, node_execution: &NodeExecution) -> Result<(), EngineError> {
        let Some(aborted) = node_executions::update_status(
            &self.inner.pool,
            &node_execution.uuid,
            Status::Aborted,
            &[Status::Discontinuing],
            |ne| ne.correlation_ids.clear(),
        )
        .await?
        else {
            return Ok(());
        };
        let (plan, node_id) = self.plan_node_of(&aborted).await?;
        if let Some(plan_node) = plan.node(&node_id) {
            self.on_status_change(&aborted, plan_node).await;
        }
        self.end_node_execution(&aborted).await
    }
}

impl std::fmt::Debug for OrchestrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationEngine")
            .field("steps", &self.inner.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// `true` for modes in which a node can be suspended.
pub(crate) fn suspendable(mode: Option<ExecutionMode>) -> bool {
    mode.map(|m| m.is_waiting() || m.is_parent()).unwrap_or(false)
}
