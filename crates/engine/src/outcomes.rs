//! Outcome storage and `<step>.output.<name>` resolution.

use chrono::Utc;
use db::models::{NodeExecution, OutcomeRecord, OutcomeRef};
use db::repository::{node_executions, outcomes};
use db::DbPool;
use serde_json::Value;
use steps::StepOutcome;

use crate::EngineError;

#[derive(Clone)]
pub struct OutcomeService {
    pool: DbPool,
}

impl OutcomeService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist every outcome of a finished step under the node's scope and
    /// return the references to attach to the node execution.  Either every
    /// outcome is stored or none is.
    pub async fn consume(
        &self,
        node_execution: &NodeExecution,
        produced: &[StepOutcome],
    ) -> Result<Vec<OutcomeRef>, EngineError> {
        if produced.is_empty() {
            return Ok(Vec::new());
        }
        let scope_key = node_execution.ambiance.scope_key();
        let now = Utc::now();
        let records = produced
            .iter()
            .map(|outcome| OutcomeRecord {
                uuid: uuid::Uuid::new_v4().to_string(),
                plan_execution_id: node_execution.plan_execution_id().to_owned(),
                scope_key: scope_key.clone(),
                produced_by: node_execution.uuid.clone(),
                step_identifier: node_execution.identifier.clone(),
                name: outcome.name.clone(),
                group: outcome.group.clone(),
                outcome: outcome.outcome.clone(),
                created_at: now,
            })
            .collect();
        let stored = outcomes::insert_outcomes(&self.pool, records).await?;
        Ok(stored
            .into_iter()
            .map(|record| OutcomeRef {
                name: record.name,
                instance_id: record.uuid,
            })
            .collect())
    }

    /// Resolve `<step identifier>.output.<outcome name>[.<json path>]`.
    ///
    /// Returns `None` when the step, the outcome or the path is missing.
    pub async fn resolve(&self, plan_execution_id: &str, expression: &str) -> Result<Option<Value>, EngineError> {
        let mut parts = expression.split('.');
        let (Some(step), Some("output"), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Ok(None);
        };

        let Some(node_execution) =
            node_executions::get_by_identifier(&self.pool, plan_execution_id, step).await?
        else {
            return Ok(None);
        };
        let Some(reference) = node_execution.outcome_refs.iter().find(|r| r.name == name) else {
            return Ok(None);
        };
        let record = outcomes::get_outcome(&self.pool, &reference.instance_id).await?;

        let mut value = &record.outcome;
        for key in parts {
            value = match value {
                Value::Object(map) => match map.get(key) {
                    Some(v) => v,
                    None => return Ok(None),
                },
                Value::Array(items) => match key.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    Some(v) => v,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            };
        }
        Ok(Some(value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::create_pool;
    use serde_json::json;
    use steps::{Ambiance, Level, StepCategory, StepType};

    async fn stored_step(pool: &DbPool) -> NodeExecution {
        let step_type = StepType::new("Shell", StepCategory::Step);
        let ambiance = Ambiance::new("pe", "plan", Default::default()).clone_for_child(Level {
            setup_id: "pn".into(),
            runtime_id: "ne".into(),
            identifier: "build".into(),
            step_type: step_type.clone(),
            group: None,
            start_ts: 0,
        });
        let ne = NodeExecution::queued("ne", ambiance, "pn", "build", step_type);
        node_executions::insert_node_execution(pool, ne).await.unwrap()
    }

    #[tokio::test]
    async fn consumed_outcomes_resolve_by_expression() {
        let pool = create_pool();
        let service = OutcomeService::new(pool.clone());
        let ne = stored_step(&pool).await;

        let produced = vec![StepOutcome {
            name: "output".into(),
            group: None,
            outcome: json!({ "artifact": { "tags": ["v1", "latest"] } }),
        }];
        let refs = service.consume(&ne, &produced).await.unwrap();
        node_executions::update(&pool, &ne.uuid, |ne| ne.outcome_refs = refs).await.unwrap();

        assert_eq!(
            service.resolve("pe", "build.output.output.artifact.tags.1").await.unwrap(),
            Some(json!("latest"))
        );
        assert!(service.resolve("pe", "build.output.missing").await.unwrap().is_none());
        assert!(service.resolve("pe", "deploy.output.output").await.unwrap().is_none());
        assert!(service.resolve("pe", "build.input.output").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clashing_outcome_rejects_the_whole_set() {
        let pool = create_pool();
        let service = OutcomeService::new(pool.clone());
        let ne = stored_step(&pool).await;

        let outcome = |name: &str| StepOutcome {
            name: name.into(),
            group: None,
            outcome: json!({ "name": name }),
        };
        let produced = vec![outcome("report"), outcome("output"), outcome("output")];
        assert!(service.consume(&ne, &produced).await.is_err());
        assert!(outcomes::fetch_by_plan_execution(&pool, "pe").await.unwrap().is_empty());
    }
}
