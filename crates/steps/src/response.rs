//! What steps hand back to the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FailureInfo, Status, TaskResponse};

/// A named result produced by a step, persisted separately from the node
/// execution that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub outcome: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitProgress {
    pub unit_name: String,
    pub status: Status,
}

/// Final result of running a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: Vec<StepOutcome>,
    #[serde(default)]
    pub unit_progress: Vec<UnitProgress>,
}

impl StepResponse {
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            failure_info: None,
            outcomes: Vec::new(),
            unit_progress: Vec::new(),
        }
    }

    pub fn succeeded() -> Self {
        Self::with_status(Status::Succeeded)
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            failure_info: Some(failure_info),
            ..Self::with_status(Status::Failed)
        }
    }

    pub fn errored(failure_info: FailureInfo) -> Self {
        Self {
            failure_info: Some(failure_info),
            ..Self::with_status(Status::Errored)
        }
    }

    pub fn with_outcome(mut self, name: impl Into<String>, outcome: Value) -> Self {
        self.outcomes.push(StepOutcome {
            name: name.into(),
            group: None,
            outcome,
        });
        self
    }

    pub fn with_unit_progress(mut self, unit_name: impl Into<String>, status: Status) -> Self {
        self.unit_progress.push(UnitProgress {
            unit_name: unit_name.into(),
            status,
        });
        self
    }
}

/// Summary of a finished child chain, delivered to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildOutcome {
    /// The node execution that ended the chain.
    pub node_execution_id: String,
    pub plan_node_id: String,
    pub identifier: String,
    /// Effective status (an ignored failure reports `IGNORE_FAILED`).
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub unit_progress: Vec<UnitProgress>,
}

/// Payload delivered through wait/notify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResponseData {
    Task(TaskResponse),
    Callback(Value),
    Child(ChildOutcome),
}
