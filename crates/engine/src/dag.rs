//! Plan validation: run this before executing an assembled plan.
//!
//! Rules enforced:
//! 1. The plan is non-empty and every node is stored under its own id.
//! 2. The starting node exists.
//! 3. Every reference (`next`, rollback target, child, children) names a node
//!    of the plan.
//! 4. The reference graph is acyclic; retries re-run a node but are not
//!    edges.
//!
//! Returns the node ids in topological order on success.

use std::collections::{BTreeMap, VecDeque};

use crate::{models::Plan, EngineError};

/// Validate the plan graph and return its nodes in topological order.
///
/// # Errors
/// [`EngineError::InvalidPlan`] naming the first violated rule.
pub fn validate_plan(plan: &Plan) -> Result<Vec<String>, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ids
    // -----------------------------------------------------------------------
    if plan.nodes.is_empty() {
        return Err(EngineError::InvalidPlan("plan has no nodes".into()));
    }
    for (key, node) in &plan.nodes {
        if key != &node.uuid {
            return Err(EngineError::InvalidPlan(format!(
                "node '{}' stored under id '{}'",
                node.uuid, key
            )));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Starting node
    // -----------------------------------------------------------------------
    if !plan.nodes.contains_key(&plan.starting_node_id) {
        return Err(EngineError::InvalidPlan(format!(
            "starting node '{}' does not exist",
            plan.starting_node_id
        )));
    }

    // -----------------------------------------------------------------------
    // 3. References
    // -----------------------------------------------------------------------
    let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> =
        plan.nodes.keys().map(|id| (id.as_str(), 0)).collect();

    for node in plan.nodes.values() {
        let mut targets = Vec::new();
        for reference in node.references() {
            let (target, _) = plan.nodes.get_key_value(&reference).ok_or_else(|| {
                EngineError::InvalidPlan(format!(
                    "node '{}' references unknown node '{}'",
                    node.identifier, reference
                ))
            })?;
            *in_degree.entry(target.as_str()).or_insert(0) += 1;
            targets.push(target.as_str());
        }
        adjacency.insert(node.uuid.as_str(), targets);
    }

    // -----------------------------------------------------------------------
    // 4. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut sorted: Vec<String> = Vec::with_capacity(plan.nodes.len());

    while let Some(node_id) = queue.pop_front() {
        sorted.push(node_id.to_owned());

        if let Some(neighbours) = adjacency.get(node_id) {
            for &neighbour in neighbours {
                let deg = in_degree.entry(neighbour).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(neighbour);
                }
            }
        }
    }

    if sorted.len() != plan.nodes.len() {
        return Err(EngineError::InvalidPlan("plan graph contains a cycle".into()));
    }

    Ok(sorted)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdviserObtainment, PlanNode};
    use serde_json::json;
    use steps::{StepCategory, StepType};

    fn step(id: &str, next: Option<&str>) -> PlanNode {
        let node = PlanNode::new(id, id, StepType::new("Mock", StepCategory::Step), json!({}));
        match next {
            Some(next) => node.with_adviser(AdviserObtainment::new(
                "NEXT_STEP",
                json!({ "next_node_id": next }),
            )),
            None => node,
        }
    }

    #[test]
    fn linear_chain_sorts_in_order() {
        let plan = Plan::new("a", vec![step("a", Some("b")), step("b", Some("c")), step("c", None)]);
        let sorted = validate_plan(&plan).expect("should be valid");
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn fork_children_are_references() {
        let fork = PlanNode::new(
            "fork",
            "fork",
            StepType::new("Fork", StepCategory::Fork),
            json!({ "children": ["x", "y"] }),
        );
        let plan = Plan::new("fork", vec![fork, step("x", None), step("y", None)]);
        let sorted = validate_plan(&plan).expect("should be valid");
        assert_eq!(sorted.first().unwrap(), "fork");
        assert_eq!(sorted.len(), 3);
    }

    #[test]
    fn missing_start_is_rejected() {
        let plan = Plan::new("ghost", vec![step("a", None)]);
        assert!(matches!(validate_plan(&plan), Err(EngineError::InvalidPlan(_))));
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let plan = Plan::new("a", vec![step("a", Some("ghost"))]);
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn cycle_is_detected() {
        let plan = Plan::new("a", vec![step("a", Some("b")), step("b", Some("a"))]);
        assert!(matches!(validate_plan(&plan), Err(EngineError::InvalidPlan(msg)) if msg.contains("cycle")));
    }
}
