//! Records stored in the document store.
//!
//! These are *persistence* models.  Apart from a few read helpers they carry
//! no behaviour; orchestration lives in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use steps::{Ambiance, ExecutionMode, FailureInfo, Status, StepType, UnitProgress};

// ---------------------------------------------------------------------------
// node_executions
// ---------------------------------------------------------------------------

/// Lightweight pointer from a node execution to one of its stored outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRef {
    pub name: String,
    pub instance_id: String,
}

/// Runtime record of one instantiated plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub uuid: String,
    /// The current level of this ambiance is this execution.
    pub ambiance: Ambiance,
    /// Id of the plan node being executed.
    pub node_id: String,
    pub identifier: String,
    pub step_type: StepType,
    /// Decided by the facilitator; `None` until facilitation happened.
    pub mode: Option<ExecutionMode>,
    pub status: Status,
    pub parent_id: Option<String>,
    pub next_id: Option<String>,
    pub previous_id: Option<String>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub expiry_ts: Option<DateTime<Utc>>,
    /// Correlation id under which the end of this node's chain is reported
    /// to the parent.  Inherited along a `next` chain.
    pub notify_id: Option<String>,
    /// Correlation ids this execution is currently waiting on.
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    #[serde(default)]
    pub additional_inputs: Value,
    #[serde(default)]
    pub resolved_step_parameters: Value,
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcome_refs: Vec<OutcomeRef>,
    #[serde(default)]
    pub unit_progress: Vec<UnitProgress>,
    /// Ids of earlier attempts of the same plan node.
    #[serde(default)]
    pub retry_ids: Vec<String>,
    /// Set once a newer attempt has superseded this one.
    #[serde(default)]
    pub old_retry: bool,
    /// A broken status that an adviser chose to ignore.
    #[serde(default)]
    pub failure_ignored: bool,
    /// Executor task id while a `TASK` node is waiting.
    pub task_id: Option<String>,
    /// Debug rendering of the adviser decision applied to this node.
    pub adviser_response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl NodeExecution {
    /// A new `QUEUED` execution with every optional field empty.
    pub fn queued(
        uuid: impl Into<String>,
        ambiance: Ambiance,
        node_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            ambiance,
            node_id: node_id.into(),
            identifier: identifier.into(),
            step_type,
            mode: None,
            status: Status::Queued,
            parent_id: None,
            next_id: None,
            previous_id: None,
            start_ts: None,
            end_ts: None,
            expiry_ts: None,
            notify_id: None,
            correlation_ids: Vec::new(),
            additional_inputs: Value::Null,
            resolved_step_parameters: Value::Null,
            failure_info: None,
            outcome_refs: Vec::new(),
            unit_progress: Vec::new(),
            retry_ids: Vec::new(),
            old_retry: false,
            failure_ignored: false,
            task_id: None,
            adviser_response: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    pub fn plan_execution_id(&self) -> &str {
        &self.ambiance.plan_execution_id
    }

    /// Status as seen by parents and projections: an ignored failure reads
    /// as `IGNORE_FAILED` while the stored status stays untouched.
    pub fn effective_status(&self) -> Status {
        if self.failure_ignored && self.status.is_broken() {
            Status::IgnoreFailed
        } else {
            self.status
        }
    }
}

// ---------------------------------------------------------------------------
// plan_executions
// ---------------------------------------------------------------------------

/// Runtime record of one execution of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecution {
    pub uuid: String,
    pub plan_id: String,
    pub status: Status,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub failure_info: Option<FailureInfo>,
    pub version: u64,
}

impl PlanExecution {
    pub fn running(uuid: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            plan_id: plan_id.into(),
            status: Status::Running,
            start_ts: Utc::now(),
            end_ts: None,
            failure_info: None,
            version: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// outcomes
// ---------------------------------------------------------------------------

/// A stored step outcome.  Unique per `(plan_execution_id, scope_key, name,
/// group)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    pub uuid: String,
    pub plan_execution_id: String,
    /// Runtime-id path of the producing scope, see `Ambiance::scope_key`.
    pub scope_key: String,
    pub produced_by: String,
    pub step_identifier: String,
    pub name: String,
    pub group: Option<String>,
    pub outcome: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use steps::StepCategory;

    #[test]
    fn ignored_failure_reads_as_ignore_failed() {
        let mut ne = NodeExecution::queued(
            "ne-1",
            Ambiance::default(),
            "pn-1",
            "shell",
            StepType::new("ShellScript", StepCategory::Step),
        );
        ne.status = Status::Failed;
        assert_eq!(ne.effective_status(), Status::Failed);

        ne.failure_ignored = true;
        assert_eq!(ne.effective_status(), Status::IgnoreFailed);
        assert_eq!(ne.status, Status::Failed);
    }
}
