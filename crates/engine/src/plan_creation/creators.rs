//! Built-in plan creators for the generic pipeline document shape.
//!
//! ```yaml
//! pipeline:
//!   identifier: build
//!   stages:
//!     - stage:
//!         identifier: compile
//!         type: CI
//!         spec:
//!           execution:
//!             steps:
//!               - step: { identifier: fetch, type: ShellScript, spec: { script: "git pull" } }
//!               - parallel:
//!                   - step: { identifier: unit, type: ShellScript }
//!                   - step: { identifier: lint, type: ShellScript }
//! ```
//!
//! Every container becomes a section node whose child is the head of the
//! chain below it; list elements are chained through `NEXT_STEP` advisers
//! whose target travels in the `next_node_id` metadata of each element.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use serde_yaml::Value;
use steps::{FailureType, StepCategory, StepType};
use tracing::debug;

use super::creator::{Dependencies, PlanCreationResponse, PlanCreatorService};
use super::yaml::{strip_uuids, wrapped_field, YamlField};
use crate::advisers::{END_PLAN, IGNORE, MARK_FAILED, NEXT_STEP, RETRY};
use crate::models::{AdviserObtainment, PlanNode};
use crate::EngineError;

pub const PIPELINE_KIND: &str = "Pipeline";
pub const STAGES_KIND: &str = "Stages";
pub const STAGE_KIND: &str = "Stage";
pub const STEPS_KIND: &str = "Steps";
pub const FORK_KIND: &str = "Fork";

const NEXT_NODE_ID: &str = "next_node_id";
const SERVICE_NAME: &str = "service_name";
const DEFAULT_STAGE_TYPE: &str = "Custom";

/// Resolves `pipeline`, `stages`, `stage`, `steps`, `parallel` and `step`
/// fields.  Anything else is handed back untouched for other modules.
#[derive(Debug, Default, Clone)]
pub struct GenericPlanCreatorService;

#[async_trait]
impl PlanCreatorService for GenericPlanCreatorService {
    fn name(&self) -> &str {
        "generic"
    }

    async fn create_plan(&self, dependencies: &Dependencies) -> anyhow::Result<PlanCreationResponse> {
        let mut response = PlanCreationResponse::default();
        for field in dependencies.values() {
            let handled = match field.name.as_str() {
                "pipeline" => create_pipeline(field, &mut response)?,
                "stages" => create_list(field, STAGES_KIND, &mut response)?,
                "steps" => create_list(field, STEPS_KIND, &mut response)?,
                "stage" => create_stage(field, &mut response)?,
                "parallel" => create_parallel(field, &mut response)?,
                "step" => create_step(field, &mut response)?,
                _ => false,
            };
            if !handled {
                response.add_dependency(field.clone());
            } else {
                debug!("resolved `{}` ({})", field.name, field.uuid);
            }
        }
        Ok(response)
    }
}

fn create_pipeline(field: &YamlField, response: &mut PlanCreationResponse) -> Result<bool, EngineError> {
    let stages = field
        .get("stages")
        .ok_or_else(|| EngineError::InvalidYaml("pipeline requires `stages`".into()))?;
    let child = YamlField::new("stages", stages.clone(), format!("{}/stages", field.uuid));

    let mut node = PlanNode::new(
        field.uuid.clone(),
        field.require_str("identifier")?,
        StepType::new(PIPELINE_KIND, StepCategory::Pipeline),
        json!({ "child_node_id": child.uuid }),
    );
    node.skip_advise = true;
    if let Some(name) = field.get_str("name") {
        node.name = name.to_owned();
    }

    response.starting_node_id = Some(node.uuid.clone());
    response.add_node(node);
    response.add_dependency(child);
    Ok(true)
}

/// A chain: the node's child is the first element, each element advances to
/// the next one.
fn create_list(field: &YamlField, kind: &str, response: &mut PlanCreationResponse) -> Result<bool, EngineError> {
    let items = field
        .node
        .as_sequence()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| EngineError::InvalidYaml(format!("`{}` must be a non-empty list", field.name)))?;
    let elements = items.iter().map(wrapped_field).collect::<Result<Vec<_>, _>>()?;

    let mut node = PlanNode::new(
        field.uuid.clone(),
        field.name.clone(),
        StepType::new(kind, StepCategory::StepGroup),
        json!({ "child_node_id": elements[0].uuid }),
    );
    node.skip_advise = true;
    response.add_node(node);

    let next_ids: Vec<Option<String>> = elements
        .iter()
        .skip(1)
        .map(|e| Some(e.uuid.clone()))
        .chain(std::iter::once(None))
        .collect();
    for (element, next) in elements.into_iter().zip(next_ids) {
        let mut element = inherit_service_name(element, field);
        if let Some(next) = next {
            element = element.with_metadata(NEXT_NODE_ID, next);
        }
        response.add_dependency(element);
    }
    Ok(true)
}

fn create_stage(field: &YamlField, response: &mut PlanCreationResponse) -> Result<bool, EngineError> {
    let stage_type = field.get_str("type").unwrap_or(DEFAULT_STAGE_TYPE).to_owned();
    let steps = field
        .get("spec")
        .and_then(|spec| spec.get("execution"))
        .and_then(|execution| execution.get("steps"))
        .or_else(|| field.get("steps"))
        .ok_or_else(|| EngineError::InvalidYaml(format!("stage ({}) has no steps", field.uuid)))?;
    let child = YamlField::new("steps", steps.clone(), format!("{}/steps", field.uuid))
        .with_metadata(SERVICE_NAME, stage_type.clone());

    let mut node = PlanNode::new(
        field.uuid.clone(),
        field.require_str("identifier")?,
        StepType::new(STAGE_KIND, StepCategory::Stage),
        json!({ "child_node_id": child.uuid }),
    )
    .with_service_name(stage_type);
    if let Some(name) = field.get_str("name") {
        node.name = name.to_owned();
    }
    node.adviser_obtainments = obtainments(field)?;

    response.add_node(node);
    response.add_dependency(child);
    Ok(true)
}

fn create_parallel(field: &YamlField, response: &mut PlanCreationResponse) -> Result<bool, EngineError> {
    let items = field
        .node
        .as_sequence()
        .ok_or_else(|| EngineError::InvalidYaml("`parallel` must be a list".into()))?;
    if items.len() < 2 {
        return Err(EngineError::InvalidYaml(format!(
            "`parallel` ({}) needs at least 2 branches, got {}",
            field.uuid,
            items.len()
        )));
    }
    let branches = items.iter().map(wrapped_field).collect::<Result<Vec<_>, _>>()?;
    let children: Vec<&str> = branches.iter().map(|b| b.uuid.as_str()).collect();

    let mut node = PlanNode::new(
        field.uuid.clone(),
        "parallel",
        StepType::new(FORK_KIND, StepCategory::Fork),
        json!({ "children": children }),
    );
    node.adviser_obtainments = obtainments(field)?;
    if let Some(service) = field.metadata.get(SERVICE_NAME) {
        node.service_name = service.clone();
    }
    response.add_node(node);

    for branch in branches {
        response.add_dependency(inherit_service_name(branch, field));
    }
    Ok(true)
}

fn create_step(field: &YamlField, response: &mut PlanCreationResponse) -> Result<bool, EngineError> {
    let kind = field.require_str("type")?;
    let params = match field.get("spec") {
        Some(spec) => to_json(spec)?,
        None => json!({}),
    };

    let mut node = PlanNode::new(
        field.uuid.clone(),
        field.require_str("identifier")?,
        StepType::new(kind, StepCategory::Step),
        params,
    );
    if let Some(name) = field.get_str("name") {
        node.name = name.to_owned();
    }
    if let Some(timeout) = field.get("timeout") {
        let secs = timeout.as_u64().ok_or_else(|| {
            EngineError::InvalidYaml(format!("step timeout must be seconds, got {timeout:?}"))
        })?;
        node = node.with_timeout_secs(secs);
    }
    if let Some(service) = field.metadata.get(SERVICE_NAME) {
        node.service_name = service.clone();
    }
    node.adviser_obtainments = obtainments(field)?;
    response.add_node(node);
    Ok(true)
}

fn inherit_service_name(element: YamlField, parent: &YamlField) -> YamlField {
    match parent.metadata.get(SERVICE_NAME) {
        Some(service) => element.with_metadata(SERVICE_NAME, service.clone()),
        None => element,
    }
}

fn to_json(value: &Value) -> Result<JsonValue, EngineError> {
    serde_json::to_value(strip_uuids(value)).map_err(|e| EngineError::InvalidYaml(e.to_string()))
}

// ---------------------------------------------------------------------------
// Failure strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct FailureStrategy {
    /// Empty means every failure type.
    #[serde(default)]
    errors: Vec<FailureType>,
    action: StrategyAction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum StrategyAction {
    #[serde(rename_all = "camelCase")]
    Retry {
        retry_count: u32,
        /// Seconds between attempts; the last one repeats.
        #[serde(default)]
        retry_intervals: Vec<u64>,
        #[serde(default)]
        on_retry_failure: AfterRetry,
    },
    Ignore,
    MarkAsFailure,
    Abort,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
enum AfterRetry {
    #[default]
    MarkAsFailure,
    Ignore,
}

/// Adviser chain of a chained element: its failure strategies in order,
/// then `NEXT_STEP`, then `MARK_FAILED` as the catch-all for failures.
fn obtainments(field: &YamlField) -> Result<Vec<AdviserObtainment>, EngineError> {
    let next = field.metadata.get(NEXT_NODE_ID);
    let strategies: Vec<FailureStrategy> = match field.get("failureStrategies") {
        Some(raw) => serde_yaml::from_value(strip_uuids(raw))
            .map_err(|e| EngineError::InvalidYaml(format!("failureStrategies: {e}")))?,
        None => Vec::new(),
    };

    let mut obtainments = Vec::with_capacity(strategies.len() + 2);
    for strategy in strategies {
        let failure_types = serde_json::to_value(&strategy.errors)
            .map_err(|e| EngineError::InvalidYaml(e.to_string()))?;
        let obtainment = match strategy.action {
            StrategyAction::Retry {
                retry_count,
                retry_intervals,
                on_retry_failure,
            } => {
                let wait_intervals: Vec<u64> = retry_intervals.iter().map(|s| s * 1000).collect();
                let after_retry = match on_retry_failure {
                    AfterRetry::MarkAsFailure => MARK_FAILED,
                    AfterRetry::Ignore => IGNORE,
                };
                AdviserObtainment::new(
                    RETRY,
                    json!({
                        "retry_count": retry_count,
                        "wait_intervals": wait_intervals,
                        "failure_types": failure_types,
                        "after_retry": after_retry,
                        NEXT_NODE_ID: next,
                    }),
                )
            }
            StrategyAction::Ignore => AdviserObtainment::new(
                IGNORE,
                json!({ "failure_types": failure_types, NEXT_NODE_ID: next }),
            ),
            StrategyAction::MarkAsFailure => {
                AdviserObtainment::new(MARK_FAILED, json!({ "failure_types": failure_types }))
            }
            StrategyAction::Abort => {
                AdviserObtainment::new(END_PLAN, json!({ "failure_types": failure_types }))
            }
        };
        obtainments.push(obtainment);
    }

    obtainments.push(AdviserObtainment::new(NEXT_STEP, json!({ NEXT_NODE_ID: next })));
    obtainments.push(AdviserObtainment::new(MARK_FAILED, json!({})));
    Ok(obtainments)
}
