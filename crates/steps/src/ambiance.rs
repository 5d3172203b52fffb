//! Ambiance: the positional execution context threaded through a running plan.
//!
//! An [`Ambiance`] is a stack of [`Level`]s, one per nested scope
//! (pipeline → stage → step), plus the setup abstractions of the tenant that
//! owns the execution.  The last level is always the current one.
//!
//! Ambiances are plain values: children derive a new one with
//! [`Ambiance::clone_for_child`] and finishing nodes hand a truncated copy to
//! their successor with [`Ambiance::clone_for_finish`].  Setup abstractions
//! are fixed at construction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{StepCategory, StepError, StepType};

/// Setup abstraction key for the account identifier.
pub const ACCOUNT_ID: &str = "accountId";
/// Setup abstraction key for the organisation identifier.
pub const ORG_IDENTIFIER: &str = "orgIdentifier";
/// Setup abstraction key for the project identifier.
pub const PROJECT_IDENTIFIER: &str = "projectIdentifier";

/// One nested scope of a running plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    /// Id of the plan node this scope instantiates.
    pub setup_id: String,
    /// Id of the node execution running this scope.
    pub runtime_id: String,
    /// User-facing identifier of the plan node.
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Milliseconds since the epoch at which the scope started.
    pub start_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ambiance {
    pub plan_execution_id: String,
    pub plan_id: String,
    setup_abstractions: BTreeMap<String, String>,
    levels: Vec<Level>,
}

impl Ambiance {
    pub fn new(
        plan_execution_id: impl Into<String>,
        plan_id: impl Into<String>,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            setup_abstractions,
            levels: Vec::new(),
        }
    }

    pub fn setup_abstractions(&self) -> &BTreeMap<String, String> {
        &self.setup_abstractions
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Copy of this ambiance with `level` pushed as the new current scope.
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut child = self.clone();
        child.levels.push(level);
        child
    }

    /// Copy of this ambiance with the current scope removed.
    ///
    /// Used when a node hands control to a sibling: the sibling pushes its own
    /// level onto the returned ambiance.
    pub fn clone_for_finish(&self) -> Self {
        self.clone_to_depth(self.levels.len().saturating_sub(1))
    }

    /// Copy of this ambiance truncated to at most `depth` levels.
    pub fn clone_to_depth(&self, depth: usize) -> Self {
        let mut cloned = self.clone();
        cloned.levels.truncate(depth);
        cloned
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    pub fn current_step_type(&self) -> Option<&StepType> {
        self.current_level().map(|l| &l.step_type)
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|l| l.group.as_deref())
    }

    /// Start timestamp of the current scope.
    ///
    /// # Errors
    /// [`StepError::InvalidAmbiance`] when the ambiance has no levels.
    pub fn current_level_start_ts(&self) -> Result<i64, StepError> {
        self.current_level()
            .map(|l| l.start_ts)
            .ok_or_else(|| StepError::InvalidAmbiance("ambiance has no levels".into()))
    }

    /// Nearest enclosing scope that is a stage.
    pub fn stage_level(&self) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.step_type.category == StepCategory::Stage)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions.get(ACCOUNT_ID).map(String::as_str)
    }

    pub fn org_identifier(&self) -> Option<&str> {
        self.setup_abstractions.get(ORG_IDENTIFIER).map(String::as_str)
    }

    pub fn project_identifier(&self) -> Option<&str> {
        self.setup_abstractions
            .get(PROJECT_IDENTIFIER)
            .map(String::as_str)
    }

    /// Scope key used to store outcomes: the runtime ids of every level,
    /// outermost first.
    pub fn scope_key(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.runtime_id.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(n: usize, category: StepCategory) -> Level {
        Level {
            setup_id: format!("setup-{n}"),
            runtime_id: format!("runtime-{n}"),
            identifier: format!("i{n}"),
            step_type: StepType::new("SECTION", category),
            group: (n % 2 == 0).then(|| "SECTION".to_string()),
            start_ts: n as i64,
        }
    }

    fn build_ambiance() -> Ambiance {
        let abstractions = BTreeMap::from([
            (ACCOUNT_ID.to_string(), "acc".to_string()),
            (ORG_IDENTIFIER.to_string(), "org".to_string()),
            (PROJECT_IDENTIFIER.to_string(), "proj".to_string()),
        ]);
        let mut ambiance = Ambiance::new("exec-1", "plan-1", abstractions);
        for (n, cat) in [
            (1, StepCategory::Pipeline),
            (2, StepCategory::Stage),
            (3, StepCategory::StepGroup),
            (4, StepCategory::Step),
        ] {
            ambiance = ambiance.clone_for_child(level(n, cat));
        }
        ambiance
    }

    #[test]
    fn clone_for_finish_drops_current_level() {
        let ambiance = build_ambiance();
        let finished = ambiance.clone_for_finish();
        assert_eq!(finished.depth(), 3);
        assert_eq!(finished.plan_execution_id, "exec-1");
        assert_eq!(finished.plan_id, "plan-1");
        assert_eq!(finished.current_runtime_id(), Some("runtime-3"));
    }

    #[test]
    fn clone_for_child_then_finish_restores_depth() {
        let ambiance = build_ambiance();
        let child = ambiance.clone_for_child(level(5, StepCategory::Step));
        assert_eq!(child.depth(), 5);
        assert_eq!(child.clone_for_finish(), ambiance);
        // The parent is untouched by the child's derivation.
        assert_eq!(ambiance.depth(), 4);
    }

    #[test]
    fn clone_to_depth_truncates_and_saturates() {
        let ambiance = build_ambiance();
        assert_eq!(ambiance.clone_to_depth(0).depth(), 0);
        assert_eq!(ambiance.clone_to_depth(2).depth(), 2);
        assert_eq!(ambiance.clone_to_depth(5).depth(), 4);
        assert_eq!(
            ambiance.clone_to_depth(0).setup_abstractions(),
            ambiance.setup_abstractions()
        );
    }

    #[test]
    fn property_getters() {
        let ambiance = build_ambiance();
        assert_eq!(ambiance.account_id(), Some("acc"));
        assert_eq!(ambiance.org_identifier(), Some("org"));
        assert_eq!(ambiance.project_identifier(), Some("proj"));
        assert_eq!(ambiance.current_setup_id(), Some("setup-4"));
        assert_eq!(ambiance.step_identifier(), Some("i4"));
        assert_eq!(ambiance.current_group(), Some("SECTION"));
        assert_eq!(ambiance.current_level_start_ts().unwrap(), 4);
        assert_eq!(ambiance.stage_level().map(|l| l.identifier.as_str()), Some("i2"));
        assert_eq!(ambiance.scope_key(), "runtime-1|runtime-2|runtime-3|runtime-4");
    }

    #[test]
    fn empty_ambiance_getters() {
        let ambiance = Ambiance::default();
        assert!(ambiance.current_runtime_id().is_none());
        assert!(ambiance.current_setup_id().is_none());
        assert!(ambiance.step_identifier().is_none());
        assert!(ambiance.current_step_type().is_none());
        assert!(ambiance.current_group().is_none());
        assert!(matches!(
            ambiance.current_level_start_ts(),
            Err(StepError::InvalidAmbiance(_))
        ));
        assert!(ambiance.clone_for_finish().levels().is_empty());
    }
}
