//! Orchestration events and the handler contracts.
//!
//! Events fire at every node status change, when a node starts, and when a
//! plan starts or ends.  See [`EventBus`] for the delivery rules.

mod bus;

use async_trait::async_trait;
use db::models::NodeExecution;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use steps::{Ambiance, Status};

pub use bus::{EventBus, EventBusBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestrationEventType {
    OrchestrationStart,
    OrchestrationEnd,
    NodeExecutionStatusUpdate,
    NodeExecutionStart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationEvent {
    pub event_type: OrchestrationEventType,
    pub ambiance: Ambiance,
    pub status: Status,
    #[serde(default)]
    pub resolved_step_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<String>,
    pub timestamp_ms: i64,
}

impl OrchestrationEvent {
    /// Event about one node execution; carries its effective status.
    pub fn for_node(event_type: OrchestrationEventType, node_execution: &NodeExecution) -> Self {
        Self {
            event_type,
            ambiance: node_execution.ambiance.clone(),
            status: node_execution.effective_status(),
            resolved_step_parameters: node_execution.resolved_step_parameters.clone(),
            node_execution_id: Some(node_execution.uuid.clone()),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Plan-level event (start/end).
    pub fn for_plan(event_type: OrchestrationEventType, ambiance: Ambiance, status: Status) -> Self {
        Self {
            event_type,
            ambiance,
            status,
            resolved_step_parameters: Value::Null,
            node_execution_id: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn plan_execution_id(&self) -> &str {
        &self.ambiance.plan_execution_id
    }
}

/// Runs in-line on the publishing task.  Must not block for long.
pub trait SyncOrchestrationEventHandler: Send + Sync {
    fn handle(&self, event: &OrchestrationEvent) -> anyhow::Result<()>;
}

/// Runs on the handler's own worker, in publish order.
#[async_trait]
pub trait AsyncOrchestrationEventHandler: Send + Sync {
    async fn handle(&self, event: &OrchestrationEvent) -> anyhow::Result<()>;
}
