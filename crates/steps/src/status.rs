//! Status model, execution modes and step types.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a node execution.
///
/// `QUEUED → RUNNING → {final statuses, SUSPENDED}`.  `SUSPENDED → RUNNING`
/// is the only backward transition; final statuses never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    /// Abort requested; waiting for children to reach a terminal status.
    Discontinuing,
    Suspended,
    Succeeded,
    /// Failed, but the failure was ignored by an adviser.
    IgnoreFailed,
    Skipped,
    Failed,
    Errored,
    Aborted,
    Expired,
}

impl Status {
    /// Statuses that can never change again.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::IgnoreFailed
                | Self::Skipped
                | Self::Failed
                | Self::Errored
                | Self::Aborted
                | Self::Expired
        )
    }

    /// Final statuses plus `SUSPENDED`.
    pub fn is_terminal(self) -> bool {
        self.is_final() || self == Self::Suspended
    }

    /// Statuses in which a node still occupies the execution flow.
    pub fn is_flowing(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Discontinuing)
    }

    pub fn is_positive(self) -> bool {
        matches!(self, Self::Succeeded | Self::IgnoreFailed | Self::Skipped)
    }

    pub fn is_broken(self) -> bool {
        matches!(self, Self::Failed | Self::Errored | Self::Expired)
    }

    /// Whether the status machine permits moving from `self` to `target`.
    pub fn can_transition_to(self, target: Status) -> bool {
        if self.is_final() || self == target {
            return false;
        }
        match self {
            Self::Queued => true,
            Self::Running => target != Self::Queued,
            Self::Discontinuing => target.is_final(),
            Self::Suspended => target == Self::Running || target.is_final(),
            _ => false,
        }
    }

    /// Rank used when aggregating several statuses into one; higher is worse.
    ///
    /// `FAILED`/`ERRORED` > `ABORTED`/`EXPIRED` > `SKIPPED` > `IGNORE_FAILED`
    /// > `SUCCEEDED`.
    pub fn severity(self) -> u8 {
        match self {
            Self::Failed => 9,
            Self::Errored => 8,
            Self::Aborted => 7,
            Self::Expired => 6,
            Self::Skipped => 4,
            Self::IgnoreFailed => 2,
            Self::Succeeded => 0,
            // A non-terminal child at aggregation time is a bug upstream;
            // treat it as an error rather than a success.
            Self::Queued | Self::Running | Self::Discontinuing | Self::Suspended => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Discontinuing => "DISCONTINUING",
            Self::Suspended => "SUSPENDED",
            Self::Succeeded => "SUCCEEDED",
            Self::IgnoreFailed => "IGNORE_FAILED",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
            Self::Errored => "ERRORED",
            Self::Aborted => "ABORTED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Every status, in declaration order.
    pub fn all() -> [Status; 11] {
        [
            Self::Queued,
            Self::Running,
            Self::Discontinuing,
            Self::Suspended,
            Self::Succeeded,
            Self::IgnoreFailed,
            Self::Skipped,
            Self::Failed,
            Self::Errored,
            Self::Aborted,
            Self::Expired,
        ]
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionMode
// ---------------------------------------------------------------------------

/// How a node runs, decided by its facilitator before any side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Task,
    TaskChain,
    Child,
    Children,
}

impl ExecutionMode {
    /// Modes whose node waits on children rather than on external work.
    pub fn is_parent(self) -> bool {
        matches!(self, Self::Child | Self::Children)
    }

    /// Modes that wait on something outside the engine and can expire.
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Async | Self::Task | Self::TaskChain)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sync => "SYNC",
            Self::Async => "ASYNC",
            Self::Task => "TASK",
            Self::TaskChain => "TASK_CHAIN",
            Self::Child => "CHILD",
            Self::Children => "CHILDREN",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// StepType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Pipeline,
    Stage,
    StepGroup,
    Step,
    Fork,
}

/// Type tag of a step; `kind` is the key facilitators and steps are
/// registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepType {
    #[serde(rename = "type")]
    pub kind: String,
    pub category: StepCategory,
}

impl StepType {
    pub fn new(kind: impl Into<String>, category: StepCategory) -> Self {
        Self {
            kind: kind.into(),
            category,
        }
    }

    pub fn is_pipeline(&self) -> bool {
        self.category == StepCategory::Pipeline
    }

    pub fn is_stage(&self) -> bool {
        self.category == StepCategory::Stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_statuses_never_transition() {
        for from in Status::all().into_iter().filter(|s| s.is_final()) {
            for to in Status::all() {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn suspended_only_goes_back_to_running() {
        assert!(Status::Suspended.can_transition_to(Status::Running));
        assert!(Status::Suspended.can_transition_to(Status::Aborted));
        assert!(!Status::Suspended.can_transition_to(Status::Queued));
        assert!(!Status::Suspended.can_transition_to(Status::Discontinuing));
        assert!(!Status::Running.can_transition_to(Status::Queued));
    }

    #[test]
    fn severity_ordering() {
        assert!(Status::Failed.severity() > Status::Aborted.severity());
        assert!(Status::Errored.severity() > Status::Expired.severity());
        assert!(Status::Aborted.severity() > Status::Skipped.severity());
        assert!(Status::Skipped.severity() > Status::Succeeded.severity());
    }

    #[test]
    fn status_serialises_screaming_snake() {
        let json = serde_json::to_string(&Status::IgnoreFailed).unwrap();
        assert_eq!(json, "\"IGNORE_FAILED\"");
        let mode: ExecutionMode = serde_json::from_str("\"TASK_CHAIN\"").unwrap();
        assert_eq!(mode, ExecutionMode::TaskChain);
    }
}
