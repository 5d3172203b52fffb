//! Advisers decide what happens after a node reaches a final status.
//!
//! A plan node lists its advisers as [`AdviserObtainment`]s.  The registry
//! walks them in order and applies the first one whose `can_advise` holds.
//! Advisers only return a decision; the engine carries it out.

mod builtin;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use db::models::NodeExecution;
use serde_json::Value;
use steps::FailureType;

pub use builtin::{
    EndPlanAdviser, IgnoreAdviser, MarkFailedAdviser, NextStepAdviser, RetryAdviser, RollbackAdviser,
};

use crate::{models::AdviserObtainment, EngineError};

pub const NEXT_STEP: &str = "NEXT_STEP";
pub const RETRY: &str = "RETRY";
pub const IGNORE: &str = "IGNORE_FAILURE";
pub const MARK_FAILED: &str = "MARK_FAILED";
pub const END_PLAN: &str = "END_PLAN";
pub const ROLLBACK: &str = "ROLLBACK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdviserResponse {
    /// Advance to `next_node_id`, or end the chain when there is none.
    NextStep { next_node_id: Option<String> },
    /// Conclude the whole plan with the node's status.
    EndPlan,
    /// Run the same plan node again after `wait`.
    Retry { wait: Duration },
    MarkFailed,
    /// Treat the failure as ignored and continue like `NextStep`.
    IgnoreFailure { next_node_id: Option<String> },
    Rollback { rollback_node_id: String },
}

/// What an adviser sees.
#[derive(Debug)]
pub struct AdvisingEvent<'a> {
    pub node_execution: &'a NodeExecution,
    /// Parameters of the obtainment being evaluated.
    pub parameters: &'a Value,
    /// Union of every failure tag of the node, `{UNKNOWN_FAILURE}` if none.
    pub failure_types: BTreeSet<FailureType>,
}

pub trait Adviser: Send + Sync {
    fn adviser_type(&self) -> &str;

    /// # Errors
    /// [`EngineError::InvalidPlan`] when the obtainment parameters the
    /// decision depends on are malformed.
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError>;

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, EngineError>;
}

/// Advisers by type, built once at startup.
#[derive(Clone, Default)]
pub struct AdviserRegistry {
    advisers: HashMap<String, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in adviser.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NextStepAdviser));
        registry.register(Arc::new(RetryAdviser));
        registry.register(Arc::new(IgnoreAdviser));
        registry.register(Arc::new(MarkFailedAdviser));
        registry.register(Arc::new(EndPlanAdviser));
        registry.register(Arc::new(RollbackAdviser));
        registry
    }

    /// Register `adviser` under its own type, replacing any previous one.
    pub fn register(&mut self, adviser: Arc<dyn Adviser>) {
        self.advisers.insert(adviser.adviser_type().to_owned(), adviser);
    }

    pub fn get(&self, adviser_type: &str) -> Option<&Arc<dyn Adviser>> {
        self.advisers.get(adviser_type)
    }

    /// Ask the node's advisers, in obtainment order, what to do next.
    ///
    /// # Errors
    /// [`EngineError::AdviserNotRegistered`] for an unknown obtainment,
    /// [`EngineError::InvalidPlan`] for malformed obtainment parameters and
    /// [`EngineError::AdviserExhausted`] when no adviser accepts the event.
    pub fn advise(
        &self,
        node_execution: &NodeExecution,
        obtainments: &[AdviserObtainment],
    ) -> Result<AdviserResponse, EngineError> {
        let failure_types = node_execution
            .failure_info
            .clone()
            .unwrap_or_default()
            .all_failure_types();

        for obtainment in obtainments {
            let adviser = self
                .get(&obtainment.adviser_type)
                .ok_or_else(|| EngineError::AdviserNotRegistered(obtainment.adviser_type.clone()))?;
            let event = AdvisingEvent {
                node_execution,
                parameters: &obtainment.parameters,
                failure_types: failure_types.clone(),
            };
            if adviser.can_advise(&event)? {
                return adviser.advise(&event);
            }
        }
        Err(EngineError::AdviserExhausted {
            node_execution_id: node_execution.uuid.clone(),
        })
    }
}
