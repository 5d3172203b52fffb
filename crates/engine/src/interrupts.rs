//! Interrupts: abort, suspend and resume, delivered over an event log.
//!
//! Interrupts are published to the engine's interrupt log and applied by an
//! [`InterruptListener`] consuming it, so any engine instance can act on an
//! interrupt raised elsewhere.  [`OrchestrationEngine::handle_interrupt`]
//! applies one directly.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use db::models::NodeExecution;
use db::repository::{node_executions, plan_executions};
use queue::{Consumer, ConsumerConfig, LogRecord, MessageListener};
use steps::Status;

use crate::executor::{suspendable, OrchestrationEngine};
use crate::EngineError;

/// Consumer group of the interrupt listener.
pub const INTERRUPT_GROUP: &str = "engine-interrupts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Interrupt {
    AbortPlan { plan_execution_id: String },
    AbortNode { node_execution_id: String },
    Suspend { node_execution_id: String },
    Resume { node_execution_id: String },
}

impl Interrupt {
    /// Partition key on the interrupt log.
    pub fn key(&self) -> &str {
        match self {
            Interrupt::AbortPlan { plan_execution_id } => plan_execution_id,
            Interrupt::AbortNode { node_execution_id }
            | Interrupt::Suspend { node_execution_id }
            | Interrupt::Resume { node_execution_id } => node_execution_id,
        }
    }
}

pub struct InterruptListener {
    engine: OrchestrationEngine,
}

impl InterruptListener {
    pub fn new(engine: OrchestrationEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MessageListener for InterruptListener {
    async fn handle(&self, record: &LogRecord) -> anyhow::Result<()> {
        let interrupt: Interrupt = record.decode()?;
        self.engine.handle_interrupt(interrupt).await?;
        Ok(())
    }
}

impl OrchestrationEngine {
    pub async fn publish_interrupt(&self, interrupt: Interrupt) -> Result<u64, EngineError> {
        let key = interrupt.key().to_owned();
        Ok(self.inner.interrupt_log.append_json(key, &interrupt).await?)
    }

    /// Consume the interrupt log until `shutdown` flips to `true`.
    pub fn start_interrupt_listener(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let listener = Arc::new(InterruptListener::new(self.clone()));
        Consumer::new(
            self.inner.interrupt_log.clone(),
            listener,
            ConsumerConfig::new(INTERRUPT_GROUP),
        )
        .spawn(shutdown)
    }

    #[instrument(skip(self))]
    pub async fn handle_interrupt(&self, interrupt: Interrupt) -> Result<(), EngineError> {
        match interrupt {
            Interrupt::AbortPlan { plan_execution_id } => self.abort_plan(&plan_execution_id).await,
            Interrupt::AbortNode { node_execution_id } => {
                let node_execution =
                    node_executions::get_node_execution(&self.inner.pool, &node_execution_id).await?;
                self.abort_subtrees(vec![node_execution]).await
            }
            Interrupt::Suspend { node_execution_id } => self.suspend(&node_execution_id).await,
            Interrupt::Resume { node_execution_id } => self.resume(&node_execution_id).await,
        }
    }

    async fn abort_plan(&self, plan_execution_id: &str) -> Result<(), EngineError> {
        let active = node_executions::fetch_active(&self.inner.pool, plan_execution_id).await?;
        if active.is_empty() {
            debug!("plan execution {} has nothing to abort", plan_execution_id);
            return Ok(());
        }
        plan_executions::update_plan_status(
            &self.inner.pool,
            plan_execution_id,
            Status::Discontinuing,
            &[Status::Running],
            |_| {},
        )
        .await?;
        info!("aborting plan execution {}", plan_execution_id);
        self.abort_subtrees(active).await
    }

    /// Abort `roots` and every active descendant.
    ///
    /// Nodes with active children become `DISCONTINUING`, top-down, and
    /// reach `ABORTED` once their children reported.  Every other node is
    /// aborted directly and its chain ends.
    async fn abort_subtrees(&self, roots: Vec<NodeExecution>) -> Result<(), EngineError> {
        let mut queue = VecDeque::from(roots);
        let mut seen = HashSet::new();
        let mut parents = Vec::new();
        let mut leaves = Vec::new();
        while let Some(node_execution) = queue.pop_front() {
            if node_execution.status.is_final() || !seen.insert(node_execution.uuid.clone()) {
                continue;
            }
            let children: Vec<NodeExecution> =
                node_executions::fetch_children(&self.inner.pool, &node_execution.uuid)
                    .await?
                    .into_iter()
                    .filter(|child| !child.status.is_final())
                    .collect();
            if children.is_empty() {
                leaves.push(node_execution);
            } else {
                parents.push(node_execution);
                queue.extend(children);
            }
        }

        for parent in parents {
            match node_executions::update_status(
                &self.inner.pool,
                &parent.uuid,
                Status::Discontinuing,
                &[Status::Queued, Status::Running],
                |_| {},
            )
            .await?
            {
                Some(discontinuing) => self.emit_status(&discontinuing).await?,
                // Suspended parents cannot discontinue; abort them outright.
                None => leaves.push(parent),
            }
        }

        for leaf in leaves {
            let Some(aborted) = node_executions::update_status(
                &self.inner.pool,
                &leaf.uuid,
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
            self.emit_status(&aborted).await?;
            self.end_node_execution(&aborted).await?;
        }
        Ok(())
    }

    async fn suspend(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let node_execution = node_executions::get_node_execution(&self.inner.pool, node_execution_id).await?;
        if !suspendable(node_execution.mode) {
            warn!(
                "node execution {} runs in mode {:?} and cannot be suspended",
                node_execution_id, node_execution.mode
            );
            return Ok(());
        }
        if let Some(suspended) = node_executions::update_status(
            &self.inner.pool,
            node_execution_id,
            Status::Suspended,
            &[Status::Running],
            |_| {},
        )
        .await?
        {
            info!("node execution {} suspended", node_execution_id);
            self.emit_status(&suspended).await?;
        }
        Ok(())
    }

    async fn resume(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let mut parked = self.inner.parked.lock().await;
        let Some(running) = node_executions::update_status(
            &self.inner.pool,
            node_execution_id,
            Status::Running,
            &[Status::Suspended],
            |_| {},
        )
        .await?
        else {
            return Ok(());
        };
        let responses = parked.remove(node_execution_id);
        drop(parked);

        info!("node execution {} resumed", node_execution_id);
        self.emit_status(&running).await?;
        if let Some(responses) = responses {
            self.spawn_resume(node_execution_id.to_owned(), responses);
        }
        Ok(())
    }

    async fn emit_status(&self, node_execution: &NodeExecution) -> Result<(), EngineError> {
        let plan = self.plan(node_execution.plan_execution_id()).await?;
        if let Some(plan_node) = plan.node(&node_execution.node_id) {
            self.on_status_change(node_execution, plan_node).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupts_are_tagged_by_type() {
        let interrupt = Interrupt::AbortPlan {
            plan_execution_id: "pe".into(),
        };
        let value = serde_json::to_value(&interrupt).unwrap();
        assert_eq!(value["type"], "ABORT_PLAN");
        assert_eq!(value["plan_execution_id"], "pe");
        assert_eq!(interrupt.key(), "pe");

        let back: Interrupt = serde_json::from_value(serde_json::json!({
            "type": "SUSPEND",
            "node_execution_id": "ne"
        }))
        .unwrap();
        assert_eq!(
            back,
            Interrupt::Suspend {
                node_execution_id: "ne".into()
            }
        );
    }
}
