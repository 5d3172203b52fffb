//! The plan graph.
//!
//! A [`Plan`] is built once per execution by plan assembly and never changes
//! afterwards.  Edges are not stored separately: a node references its chain
//! successor through its adviser parameters and its children through its
//! step parameters (see [`PlanNode::references`]).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use steps::StepType;

/// One adviser attached to a plan node, with the parameters it advises on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    pub adviser_type: String,
    #[serde(default)]
    pub parameters: Value,
}

impl AdviserObtainment {
    pub fn new(adviser_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            adviser_type: adviser_type.into(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Unique within the plan.
    pub uuid: String,
    pub identifier: String,
    pub name: String,
    pub step_type: StepType,
    /// Module that owns this node (e.g. the stage type).
    pub service_name: String,
    #[serde(default)]
    pub step_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Evaluated in order; the first adviser whose `can_advise` holds wins.
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,
    /// End the node without consulting any adviser.
    #[serde(default)]
    pub skip_advise: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl PlanNode {
    pub fn new(
        uuid: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
        step_parameters: Value,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            uuid: uuid.into(),
            name: identifier.clone(),
            identifier,
            service_name: "pipeline".into(),
            step_type,
            step_parameters,
            group: None,
            adviser_obtainments: Vec::new(),
            skip_advise: false,
            timeout_secs: None,
        }
    }

    pub fn with_adviser(mut self, obtainment: AdviserObtainment) -> Self {
        self.adviser_obtainments.push(obtainment);
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Ids of every plan node this node can hand control to.
    pub fn references(&self) -> Vec<String> {
        let mut refs = Vec::new();
        if let Some(child) = self.step_parameters.get("child_node_id").and_then(Value::as_str) {
            refs.push(child.to_owned());
        }
        if let Some(children) = self.step_parameters.get("children").and_then(Value::as_array) {
            refs.extend(children.iter().filter_map(Value::as_str).map(str::to_owned));
        }
        for obtainment in &self.adviser_obtainments {
            for key in ["next_node_id", "rollback_node_id"] {
                if let Some(id) = obtainment.parameters.get(key).and_then(Value::as_str) {
                    refs.push(id.to_owned());
                }
            }
        }
        refs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub uuid: String,
    pub nodes: BTreeMap<String, PlanNode>,
    pub starting_node_id: String,
}

impl Plan {
    pub fn new(starting_node_id: impl Into<String>, nodes: impl IntoIterator<Item = PlanNode>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            nodes: nodes.into_iter().map(|n| (n.uuid.clone(), n)).collect(),
            starting_node_id: starting_node_id.into(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    pub fn starting_node(&self) -> Option<&PlanNode> {
        self.nodes.get(&self.starting_node_id)
    }
}
