//! Execution summary projection.
//!
//! One schemaless document per plan execution:
//!
//! ```json
//! {
//!   "planExecutionId": "...", "planId": "...", "status": "RUNNING",
//!   "startTs": 0, "endTs": null, "executionErrorInfo": null,
//!   "modules": ["CI"],
//!   "layoutNodeMap": { "<stage node id>": { "status": "...", "failureTypes": [], ... } },
//!   "moduleInfo": { "<module>": { ... } }
//! }
//! ```
//!
//! Updates are computed as [`FieldPatch`]es touching only the fields the
//! node owns.  The projection is best effort: a failed update is logged and
//! picked up again by the node's next status change.

use std::collections::BTreeMap;
use std::sync::Arc;

use db::models::NodeExecution;
use db::repository::summaries;
use db::{DbPool, FieldPatch};
use serde_json::{json, Map, Value};
use steps::Status;
use tracing::warn;

use crate::models::{Plan, PlanNode};

/// Step kind whose nodes flag their stage with `barrierFound`.
pub const BARRIER_KIND: &str = "Barrier";

/// Module-specific stage details, merged under `moduleInfo.<module>`.
pub trait ModuleInfoProvider: Send + Sync {
    /// Module (plan node service name) this provider describes.
    fn module(&self) -> &str;

    fn module_info(&self, node_execution: &NodeExecution) -> BTreeMap<String, Value>;
}

#[derive(Clone)]
pub struct ExecutionSummaryUpdater {
    pool: DbPool,
    providers: Vec<Arc<dyn ModuleInfoProvider>>,
}

fn millis(ts: Option<chrono::DateTime<chrono::Utc>>) -> Value {
    ts.map(|t| json!(t.timestamp_millis())).unwrap_or(Value::Null)
}

impl ExecutionSummaryUpdater {
    pub fn new(pool: DbPool, providers: Vec<Arc<dyn ModuleInfoProvider>>) -> Self {
        Self { pool, providers }
    }

    /// Initial document: top-level fields plus a `NOT_STARTED` layout entry
    /// for every stage of the plan.
    pub fn initial_document(plan_execution_id: &str, plan: &Plan, start_ts: i64) -> Value {
        let mut layout = Map::new();
        for node in plan.nodes.values().filter(|n| n.step_type.is_stage()) {
            layout.insert(
                node.uuid.clone(),
                json!({
                    "nodeIdentifier": node.identifier,
                    "name": node.name,
                    "nodeType": node.step_type.kind,
                    "module": node.service_name,
                    "status": "NOT_STARTED",
                    "failureTypes": [],
                    "barrierFound": false,
                }),
            );
        }
        json!({
            "planExecutionId": plan_execution_id,
            "planId": plan.uuid,
            "status": Status::Running,
            "startTs": start_ts,
            "endTs": null,
            "executionErrorInfo": null,
            "modules": [],
            "layoutNodeMap": layout,
            "moduleInfo": {},
        })
    }

    pub async fn create_initial(&self, plan_execution_id: &str, plan: &Plan) -> Result<(), db::DbError> {
        let document =
            Self::initial_document(plan_execution_id, plan, chrono::Utc::now().timestamp_millis());
        summaries::insert_summary(&self.pool, plan_execution_id, document).await
    }

    /// Patches describing `node_execution`'s current state.  Empty for nodes
    /// the summary does not track.
    pub fn build_update(&self, node_execution: &NodeExecution, plan_node: &PlanNode) -> Vec<FieldPatch> {
        let mut patches = Vec::new();
        let status = node_execution.effective_status();

        if plan_node.step_type.is_stage() {
            let base = format!("layoutNodeMap.{}", plan_node.uuid);
            patches.push(FieldPatch::set(format!("{base}.status"), json!(status)));
            patches.push(FieldPatch::set(format!("{base}.nodeExecutionId"), json!(node_execution.uuid)));
            patches.push(FieldPatch::set(format!("{base}.startTs"), millis(node_execution.start_ts)));
            patches.push(FieldPatch::set(format!("{base}.endTs"), millis(node_execution.end_ts)));
            patches.push(FieldPatch::set(
                format!("{base}.failureInfo"),
                json!(node_execution.failure_info),
            ));
            if let Some(info) = &node_execution.failure_info {
                let types = info.all_failure_types().into_iter().map(|t| json!(t)).collect();
                patches.push(FieldPatch::add_to_set(format!("{base}.failureTypes"), types));
            }
            patches.push(FieldPatch::add_to_set("modules", vec![json!(plan_node.service_name)]));

            for provider in self.providers.iter().filter(|p| p.module() == plan_node.service_name) {
                for (key, value) in provider.module_info(node_execution) {
                    patches.push(FieldPatch::set(
                        format!("moduleInfo.{}.{}", plan_node.service_name, key),
                        value,
                    ));
                }
            }
        }

        if plan_node.step_type.is_pipeline() {
            patches.push(FieldPatch::set("status", json!(status)));
            patches.push(FieldPatch::set("endTs", millis(node_execution.end_ts)));
            patches.push(FieldPatch::set(
                "executionErrorInfo",
                json!(node_execution.failure_info),
            ));
        }

        if plan_node.step_type.kind == BARRIER_KIND {
            if let Some(stage) = node_execution.ambiance.stage_level() {
                patches.push(FieldPatch::set(
                    format!("layoutNodeMap.{}.barrierFound", stage.setup_id),
                    Value::Bool(true),
                ));
            }
        }
        patches
    }

    pub async fn on_node_status_changed(&self, node_execution: &NodeExecution, plan_node: &PlanNode) {
        let patches = self.build_update(node_execution, plan_node);
        if patches.is_empty() {
            return;
        }
        if let Err(e) =
            summaries::patch_summary(&self.pool, node_execution.plan_execution_id(), &patches).await
        {
            warn!(
                "summary update for node execution {} failed: {}",
                node_execution.uuid, e
            );
        }
    }

    /// Final top-level fields once the plan concluded.  The error info of
    /// the node that ended the plan surfaces here.
    pub async fn on_plan_end(
        &self,
        plan_execution_id: &str,
        status: Status,
        failure_info: Option<&steps::FailureInfo>,
    ) {
        let mut patches = vec![
            FieldPatch::set("status", json!(status)),
            FieldPatch::set("endTs", json!(chrono::Utc::now().timestamp_millis())),
        ];
        if let Some(info) = failure_info {
            patches.push(FieldPatch::set("executionErrorInfo", json!(info)));
        }
        if let Err(e) = summaries::patch_summary(&self.pool, plan_execution_id, &patches).await {
            warn!("summary end for plan execution {} failed: {}", plan_execution_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::create_pool;
    use steps::{Ambiance, FailureInfo, FailureType, Level, StepCategory, StepType};

    struct CiInfo;

    impl ModuleInfoProvider for CiInfo {
        fn module(&self) -> &str {
            "CI"
        }

        fn module_info(&self, node_execution: &NodeExecution) -> BTreeMap<String, Value> {
            BTreeMap::from([("lastStatus".to_string(), json!(node_execution.status))])
        }
    }

    fn stage_node(id: &str) -> PlanNode {
        PlanNode::new(id, id, StepType::new("Stage", StepCategory::Stage), json!({})).with_service_name("CI")
    }

    fn plan() -> Plan {
        let pipeline = PlanNode::new("p", "p", StepType::new("Pipeline", StepCategory::Pipeline), json!({}));
        Plan::new("p", vec![pipeline, stage_node("s1"), stage_node("s2")])
    }

    fn execution(node: &PlanNode, status: Status) -> NodeExecution {
        let mut ne = NodeExecution::queued(
            format!("ne-{}", node.uuid),
            Ambiance::new("pe", "plan", Default::default()),
            node.uuid.clone(),
            node.identifier.clone(),
            node.step_type.clone(),
        );
        ne.status = status;
        ne
    }

    #[test]
    fn initial_document_lists_stages() {
        let doc = ExecutionSummaryUpdater::initial_document("pe", &plan(), 7);
        assert_eq!(doc["status"], "RUNNING");
        assert_eq!(doc["layoutNodeMap"]["s1"]["status"], "NOT_STARTED");
        assert_eq!(doc["layoutNodeMap"]["s2"]["module"], "CI");
        assert!(doc["layoutNodeMap"].get("p").is_none());
    }

    #[test]
    fn plain_steps_produce_no_patches() {
        let updater = ExecutionSummaryUpdater::new(create_pool(), Vec::new());
        let step = PlanNode::new("x", "x", StepType::new("Shell", StepCategory::Step), json!({}));
        assert!(updater.build_update(&execution(&step, Status::Running), &step).is_empty());
    }

    #[tokio::test]
    async fn sibling_stages_update_independently() {
        let pool = create_pool();
        let updater = ExecutionSummaryUpdater::new(pool.clone(), vec![Arc::new(CiInfo)]);
        let plan = plan();
        updater.create_initial("pe", &plan).await.unwrap();

        let s1 = plan.node("s1").unwrap();
        let s2 = plan.node("s2").unwrap();
        let mut failed = execution(s2, Status::Failed);
        failed.failure_info = Some(FailureInfo::new("boom").with_type(FailureType::ApplicationFailure));

        let ok = execution(s1, Status::Succeeded);
        tokio::join!(
            updater.on_node_status_changed(&ok, s1),
            updater.on_node_status_changed(&failed, s2),
        );

        let doc = summaries::get_summary(&pool, "pe").await.unwrap();
        assert_eq!(doc["layoutNodeMap"]["s1"]["status"], "SUCCEEDED");
        assert_eq!(doc["layoutNodeMap"]["s2"]["status"], "FAILED");
        assert_eq!(doc["layoutNodeMap"]["s2"]["failureTypes"], json!(["APPLICATION_FAILURE"]));
        assert_eq!(doc["layoutNodeMap"]["s1"]["failureTypes"], json!([]));
        assert_eq!(doc["modules"], json!(["CI"]));
        assert_eq!(doc["moduleInfo"]["CI"]["lastStatus"], "FAILED");
        assert_eq!(doc["status"], "RUNNING");
    }

    #[tokio::test]
    async fn barrier_flags_its_stage() {
        let updater = ExecutionSummaryUpdater::new(create_pool(), Vec::new());
        let stage_type = StepType::new("Stage", StepCategory::Stage);
        let barrier = PlanNode::new("b", "b", StepType::new(BARRIER_KIND, StepCategory::Step), json!({}));
        let mut ne = execution(&barrier, Status::Running);
        ne.ambiance = ne.ambiance.clone_for_child(Level {
            setup_id: "s1".into(),
            runtime_id: "ne-s1".into(),
            identifier: "s1".into(),
            step_type: stage_type,
            group: None,
            start_ts: 0,
        });

        let patches = updater.build_update(&ne, &barrier);
        assert_eq!(
            patches,
            vec![FieldPatch::set("layoutNodeMap.s1.barrierFound", Value::Bool(true))]
        );
    }

    #[tokio::test]
    async fn missing_summary_is_only_logged() {
        let updater = ExecutionSummaryUpdater::new(create_pool(), Vec::new());
        let plan = plan();
        let s1 = plan.node("s1").unwrap();
        updater
            .on_node_status_changed(&execution(s1, Status::Running), s1)
            .await;
    }
}
