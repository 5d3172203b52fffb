//! The plan-creation merge service.
//!
//! Assembly is a fixed-point loop.  Each iteration hands the current
//! dependencies to every registered [`PlanCreatorService`] concurrently and
//! merges the answers:
//!
//! * nodes are unioned (the first producer of an id wins),
//! * the first non-empty starting node id wins,
//! * a fragment is resolved once any service omitted it; the new
//!   dependencies are the union of every answer minus resolved fragments.
//!
//! The loop ends when no dependency is left, fails fast when an iteration
//! produced nothing (if configured), and is bounded by `max_depth`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::creator::{Dependencies, PlanCreationResponse, PlanCreatorService};
use super::yaml::{inject_uuids, parse_document, wrapped_field, YamlField};
use crate::{
    dag::validate_plan,
    error::UnresolvedField,
    models::{Plan, PlanNode},
    EngineConfig, EngineError,
};

pub struct PlanCreationMergeService {
    services: Vec<Arc<dyn PlanCreatorService>>,
    config: EngineConfig,
}

type IterationResult = (usize, String, anyhow::Result<PlanCreationResponse>);

impl PlanCreationMergeService {
    pub fn new(services: Vec<Arc<dyn PlanCreatorService>>, config: EngineConfig) -> Self {
        Self { services, config }
    }

    /// Assemble a plan from a pipeline document.
    ///
    /// # Errors
    /// [`EngineError::InvalidYaml`], [`EngineError::UnresolvableYaml`],
    /// [`EngineError::NoStartingNode`], [`EngineError::PlanCreator`],
    /// [`EngineError::PlanCreationTimeout`] or [`EngineError::InvalidPlan`].
    #[instrument(skip_all)]
    pub async fn create_plan(&self, document: &str) -> Result<Plan, EngineError> {
        let mut doc = parse_document(document)?;
        inject_uuids(&mut doc);
        let root = wrapped_field(&doc)?;
        self.create_plan_from(root).await
    }

    /// Assemble a plan starting from one root fragment.
    pub async fn create_plan_from(&self, root: YamlField) -> Result<Plan, EngineError> {
        let mut dependencies: Dependencies = BTreeMap::from([(root.uuid.clone(), root)]);
        let mut nodes: BTreeMap<String, PlanNode> = BTreeMap::new();
        let mut starting_node_id: Option<String> = None;
        let mut iteration = 0;

        while !dependencies.is_empty() && iteration < self.config.max_depth {
            iteration += 1;
            debug!(
                "plan creation iteration {} with {} dependencies",
                iteration,
                dependencies.len()
            );

            let responses = self.run_iteration(iteration, &dependencies).await?;

            let mut produced = 0usize;
            let mut resolved: BTreeSet<String> = BTreeSet::new();
            let mut merged = Dependencies::new();

            for response in responses {
                resolved.extend(
                    dependencies
                        .keys()
                        .filter(|key| !response.dependencies.contains_key(*key))
                        .cloned(),
                );
                for (id, node) in response.nodes {
                    if nodes.contains_key(&id) {
                        warn!("plan node '{}' produced twice; keeping the first", id);
                        continue;
                    }
                    nodes.insert(id, node);
                    produced += 1;
                }
                if starting_node_id.is_none() {
                    starting_node_id = response.starting_node_id;
                }
                for (key, field) in response.dependencies {
                    merged.entry(key).or_insert(field);
                }
            }
            merged.retain(|key, _| !resolved.contains(key));

            let no_progress = produced == 0 && merged.keys().eq(dependencies.keys());
            dependencies = merged;
            if no_progress && self.config.fail_fast_on_no_progress {
                warn!("plan creation made no progress in iteration {}", iteration);
                return Err(unresolvable(&dependencies));
            }
        }

        if !dependencies.is_empty() {
            return Err(unresolvable(&dependencies));
        }
        let starting_node_id = starting_node_id.ok_or(EngineError::NoStartingNode)?;

        let plan = Plan {
            uuid: uuid::Uuid::new_v4().to_string(),
            nodes,
            starting_node_id,
        };
        validate_plan(&plan)?;
        info!(
            "plan {} assembled in {} iterations ({} nodes)",
            plan.uuid,
            iteration,
            plan.nodes.len()
        );
        Ok(plan)
    }

    /// Call every service once, bounded by the worker pool, under the
    /// iteration timeout.  Responses come back in registration order.
    async fn run_iteration(
        &self,
        iteration: usize,
        dependencies: &Dependencies,
    ) -> Result<Vec<PlanCreationResponse>, EngineError> {
        let shared = Arc::new(dependencies.clone());
        let semaphore = Arc::new(Semaphore::new(self.config.plan_creator_workers.max(1)));
        let mut join_set: JoinSet<IterationResult> = JoinSet::new();

        for (index, service) in self.services.iter().enumerate() {
            let service = service.clone();
            let shared = shared.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let name = service.name().to_owned();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (index, name, Err(anyhow::anyhow!(e))),
                };
                let result = service.create_plan(&shared).await;
                (index, name, result)
            });
        }

        let collect = async {
            let mut results: Vec<(usize, PlanCreationResponse)> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((index, _, Ok(response))) => results.push((index, response)),
                    Ok((_, service, Err(err))) => {
                        return Err(EngineError::PlanCreator {
                            service,
                            message: format!("{err:#}"),
                        })
                    }
                    Err(join_err) => {
                        return Err(EngineError::PlanCreator {
                            service: "<panicked>".into(),
                            message: join_err.to_string(),
                        })
                    }
                }
            }
            Ok(results)
        };

        let mut results = tokio::time::timeout(self.config.plan_creation_timeout, collect)
            .await
            .map_err(|_| EngineError::PlanCreationTimeout { iteration })??;
        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, response)| response).collect())
    }
}

fn unresolvable(dependencies: &Dependencies) -> EngineError {
    EngineError::UnresolvableYaml {
        unresolved: dependencies
            .values()
            .map(|field| UnresolvedField {
                uuid: field.uuid.clone(),
                name: field.name.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AdviserObtainment;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use steps::{StepCategory, StepType};

    /// Resolves at most one `step` field per call; a nested `next.step`
    /// becomes a new dependency.
    #[derive(Default)]
    struct OneStepPerCall {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PlanCreatorService for OneStepPerCall {
        fn name(&self) -> &str {
            "one-step"
        }

        async fn create_plan(&self, dependencies: &Dependencies) -> anyhow::Result<PlanCreationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut response = PlanCreationResponse::unchanged(dependencies);
            let Some(field) = dependencies.values().find(|f| f.name == "step").cloned() else {
                return Ok(response);
            };
            response.dependencies.remove(&field.uuid);

            let mut node = PlanNode::new(
                field.uuid.clone(),
                field.require_str("identifier")?,
                StepType::new("Mock", StepCategory::Step),
                json!({}),
            );
            if let Some(next) = field.get("next") {
                let next_field = wrapped_field(next)?;
                node = node.with_adviser(AdviserObtainment::new(
                    "NEXT_STEP",
                    json!({ "next_node_id": next_field.uuid }),
                ));
                response.add_dependency(next_field);
            }
            if field.get_str("identifier") == Some("A") {
                response.starting_node_id = Some(field.uuid.clone());
            }
            response.add_node(node);
            Ok(response)
        }
    }

    /// Never resolves anything.
    struct Idle;

    #[async_trait]
    impl PlanCreatorService for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn create_plan(&self, dependencies: &Dependencies) -> anyhow::Result<PlanCreationResponse> {
            Ok(PlanCreationResponse::unchanged(dependencies))
        }
    }

    struct Failing;

    #[async_trait]
    impl PlanCreatorService for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn create_plan(&self, _: &Dependencies) -> anyhow::Result<PlanCreationResponse> {
            anyhow::bail!("module offline")
        }
    }

    struct Slow;

    #[async_trait]
    impl PlanCreatorService for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn create_plan(&self, dependencies: &Dependencies) -> anyhow::Result<PlanCreationResponse> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(PlanCreationResponse::unchanged(dependencies))
        }
    }

    const CHAIN: &str = r#"
step:
  identifier: A
  next:
    step:
      identifier: B
      next:
        step:
          identifier: C
"#;

    #[tokio::test]
    async fn sequential_chain_converges_in_three_iterations() {
        let creator = Arc::new(OneStepPerCall::default());
        let service = PlanCreationMergeService::new(
            vec![creator.clone(), Arc::new(Idle)],
            EngineConfig::default(),
        );

        let plan = service.create_plan(CHAIN).await.unwrap();

        assert_eq!(creator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(plan.nodes.len(), 3);
        assert_eq!(plan.starting_node().unwrap().identifier, "A");
    }

    #[tokio::test]
    async fn unhandled_field_fails_fast_with_its_id() {
        let service = PlanCreationMergeService::new(vec![Arc::new(Idle)], EngineConfig::default());
        let err = service.create_plan("stage:\n  identifier: s\n").await.unwrap_err();
        match err {
            EngineError::UnresolvableYaml { unresolved } => {
                assert_eq!(unresolved.len(), 1);
                assert_eq!(unresolved[0].name, "stage");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn without_fail_fast_the_loop_runs_to_max_depth() {
        let config = EngineConfig {
            fail_fast_on_no_progress: false,
            max_depth: 2,
            ..EngineConfig::default()
        };
        let service = PlanCreationMergeService::new(vec![Arc::new(Idle)], config);
        assert!(matches!(
            service.create_plan("stage: {}\n").await,
            Err(EngineError::UnresolvableYaml { .. })
        ));
    }

    #[tokio::test]
    async fn depth_limit_leaves_dependencies_unresolved() {
        let config = EngineConfig {
            max_depth: 2,
            ..EngineConfig::default()
        };
        let service = PlanCreationMergeService::new(vec![Arc::new(OneStepPerCall::default())], config);
        let err = service.create_plan(CHAIN).await.unwrap_err();
        assert!(matches!(err, EngineError::UnresolvableYaml { unresolved } if unresolved[0].name == "step"));
    }

    #[tokio::test]
    async fn creator_error_is_fatal() {
        let service = PlanCreationMergeService::new(
            vec![Arc::new(OneStepPerCall::default()), Arc::new(Failing)],
            EngineConfig::default(),
        );
        let err = service.create_plan(CHAIN).await.unwrap_err();
        assert!(matches!(err, EngineError::PlanCreator { service, .. } if service == "failing"));
    }

    #[tokio::test]
    async fn missing_start_node_is_reported() {
        let service = PlanCreationMergeService::new(
            vec![Arc::new(OneStepPerCall::default())],
            EngineConfig::default(),
        );
        let err = service.create_plan("step:\n  identifier: Z\n").await.unwrap_err();
        assert!(matches!(err, EngineError::NoStartingNode));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_iteration_times_out() {
        let config = EngineConfig {
            plan_creation_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let service = PlanCreationMergeService::new(vec![Arc::new(Slow)], config);
        let err = service.create_plan(CHAIN).await.unwrap_err();
        assert!(matches!(err, EngineError::PlanCreationTimeout { iteration: 1 }));
    }
}
