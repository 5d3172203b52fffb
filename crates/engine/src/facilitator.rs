//! Facilitators decide how a node runs before anything happens to it.
//!
//! Facilitation is read-only: it sees the ambiance and the plan node and
//! returns the execution mode plus, for modes that wait on external work,
//! the timeout after which the reaper expires the node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use steps::{Ambiance, ExecutionMode};

use crate::{models::PlanNode, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacilitatorResponse {
    pub mode: ExecutionMode,
    /// Only set for waiting modes.
    pub timeout: Option<Duration>,
}

pub trait Facilitator: Send + Sync {
    fn facilitate(&self, ambiance: &Ambiance, node: &PlanNode) -> Result<FacilitatorResponse, EngineError>;
}

/// Always answers the same mode.  Waiting modes time out after the node's
/// own `timeout`, or `default_timeout` when the node has none.
#[derive(Debug, Clone)]
pub struct StaticFacilitator {
    mode: ExecutionMode,
    default_timeout: Duration,
}

impl StaticFacilitator {
    pub fn new(mode: ExecutionMode, default_timeout: Duration) -> Self {
        Self { mode, default_timeout }
    }
}

impl Facilitator for StaticFacilitator {
    fn facilitate(&self, _ambiance: &Ambiance, node: &PlanNode) -> Result<FacilitatorResponse, EngineError> {
        let timeout = self
            .mode
            .is_waiting()
            .then(|| node.timeout().unwrap_or(self.default_timeout));
        Ok(FacilitatorResponse {
            mode: self.mode,
            timeout,
        })
    }
}

/// One facilitator per step kind.
#[derive(Clone, Default)]
pub struct FacilitatorRegistry {
    facilitators: HashMap<String, Arc<dyn Facilitator>>,
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step_kind: impl Into<String>, facilitator: Arc<dyn Facilitator>) {
        self.facilitators.insert(step_kind.into(), facilitator);
    }

    pub fn contains(&self, step_kind: &str) -> bool {
        self.facilitators.contains_key(step_kind)
    }

    pub fn facilitate(&self, ambiance: &Ambiance, node: &PlanNode) -> Result<FacilitatorResponse, EngineError> {
        self.facilitators
            .get(&node.step_type.kind)
            .ok_or_else(|| EngineError::StepNotRegistered(node.step_type.kind.clone()))?
            .facilitate(ambiance, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steps::{StepCategory, StepType};

    fn node(kind: &str) -> PlanNode {
        PlanNode::new("pn", "id", StepType::new(kind, StepCategory::Step), json!({}))
    }

    #[test]
    fn waiting_modes_receive_a_timeout() {
        let mut registry = FacilitatorRegistry::new();
        registry.register("Shell", Arc::new(StaticFacilitator::new(ExecutionMode::Task, Duration::from_secs(60))));
        registry.register("Noop", Arc::new(StaticFacilitator::new(ExecutionMode::Sync, Duration::from_secs(60))));

        let shell = registry.facilitate(&Ambiance::default(), &node("Shell")).unwrap();
        assert_eq!(shell.mode, ExecutionMode::Task);
        assert_eq!(shell.timeout, Some(Duration::from_secs(60)));

        let custom = registry
            .facilitate(&Ambiance::default(), &node("Shell").with_timeout_secs(5))
            .unwrap();
        assert_eq!(custom.timeout, Some(Duration::from_secs(5)));

        let noop = registry.facilitate(&Ambiance::default(), &node("Noop")).unwrap();
        assert_eq!(noop.timeout, None);
    }

    #[test]
    fn unknown_kind_is_not_registered() {
        let registry = FacilitatorRegistry::new();
        assert!(matches!(
            registry.facilitate(&Ambiance::default(), &node("Ghost")),
            Err(EngineError::StepNotRegistered(kind)) if kind == "Ghost"
        ));
    }
}
