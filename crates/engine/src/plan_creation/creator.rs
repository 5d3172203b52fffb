//! The plan-creator plugin contract.
//!
//! Each module ships a [`PlanCreatorService`].  On every assembly iteration
//! the service sees the whole dependencies map and answers with the nodes it
//! could produce, optionally the starting node, and the dependencies it is
//! leaving unresolved.  A fragment the service does not handle is returned
//! unchanged; omitting a fragment means "resolved by me".

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::YamlField;
use crate::models::PlanNode;

/// Pending fragments keyed by their YAML uuid.
pub type Dependencies = BTreeMap<String, YamlField>;

#[derive(Debug, Clone, Default)]
pub struct PlanCreationResponse {
    pub nodes: BTreeMap<String, PlanNode>,
    pub starting_node_id: Option<String>,
    pub dependencies: Dependencies,
}

impl PlanCreationResponse {
    /// A response that resolves nothing.
    pub fn unchanged(dependencies: &Dependencies) -> Self {
        Self {
            dependencies: dependencies.clone(),
            ..Self::default()
        }
    }

    pub fn add_node(&mut self, node: PlanNode) {
        self.nodes.insert(node.uuid.clone(), node);
    }

    pub fn add_dependency(&mut self, field: YamlField) {
        self.dependencies.insert(field.uuid.clone(), field);
    }
}

#[async_trait]
pub trait PlanCreatorService: Send + Sync {
    fn name(&self) -> &str;

    async fn create_plan(&self, dependencies: &Dependencies) -> anyhow::Result<PlanCreationResponse>;
}
