//! Fork/join: spawn concurrent children and aggregate their results.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{ChildOutcome, ChildrenExecutable, FailureInfo, Status, StepContext, StepError, StepResponse};

/// Generic `CHILDREN` step.  Parameters: `{"children": ["<plan node id>", ...]}`.
#[derive(Debug, Default, Clone)]
pub struct ForkStep;

impl ChildrenExecutable for ForkStep {
    fn obtain_children(&self, _ctx: &StepContext, params: &Value) -> Result<Vec<String>, StepError> {
        let children: Vec<String> = params
            .get("children")
            .and_then(Value::as_array)
            .ok_or_else(|| StepError::InvalidParameters("fork requires a `children` array".into()))?
            .iter()
            .map(|c| {
                c.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| StepError::InvalidParameters(format!("child id must be a string, got {c}")))
            })
            .collect::<Result<_, _>>()?;

        if children.len() < 2 {
            return Err(StepError::InvalidParameters(format!(
                "fork requires at least 2 children, got {}",
                children.len()
            )));
        }
        Ok(children)
    }

    fn handle_children_response(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        responses: &BTreeMap<String, ChildOutcome>,
    ) -> Result<StepResponse, StepError> {
        Ok(aggregate_children(responses.values()))
    }
}

/// Fold child outcomes into one response.
///
/// The status is `SUCCEEDED` only when every child succeeded; otherwise it is
/// the worst child status by [`Status::severity`].  Failure info and unit
/// progress of every non-succeeded child are concatenated in iteration order.
pub fn aggregate_children<'a>(children: impl IntoIterator<Item = &'a ChildOutcome>) -> StepResponse {
    let mut status = Status::Succeeded;
    let mut failure: Option<FailureInfo> = None;
    let mut response = StepResponse::succeeded();

    for child in children {
        if child.status == Status::Succeeded {
            continue;
        }
        if child.status.severity() > status.severity() {
            status = child.status;
        }
        if let Some(info) = &child.failure_info {
            failure.get_or_insert_with(FailureInfo::default).absorb(info);
        }
        response.unit_progress.extend(child.unit_progress.iter().cloned());
    }

    response.status = status;
    response.failure_info = failure;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ambiance, FailureType, StepCategory, StepType};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn ctx() -> StepContext {
        StepContext {
            ambiance: Ambiance::default(),
            node_execution_id: "fork-ne".into(),
            plan_node_id: "fork".into(),
            identifier: "fork".into(),
            step_type: StepType::new("Fork", StepCategory::Fork),
        }
    }

    fn child(id: &str, status: Status, failure: Option<FailureInfo>) -> ChildOutcome {
        ChildOutcome {
            node_execution_id: format!("ne-{id}"),
            plan_node_id: id.into(),
            identifier: id.into(),
            status,
            failure_info: failure,
            unit_progress: Vec::new(),
        }
    }

    #[test]
    fn obtain_children_requires_two() {
        let err = ForkStep.obtain_children(&ctx(), &json!({ "children": ["x"] })).unwrap_err();
        assert!(matches!(err, StepError::InvalidParameters(_)));

        let children = ForkStep
            .obtain_children(&ctx(), &json!({ "children": ["x", "y"] }))
            .unwrap();
        assert_eq!(children, vec!["x", "y"]);
    }

    #[test]
    fn all_succeeded_children_succeed() {
        let responses = BTreeMap::from([
            ("x".to_string(), child("x", Status::Succeeded, None)),
            ("y".to_string(), child("y", Status::Succeeded, None)),
        ]);
        let response = ForkStep.handle_children_response(&ctx(), &Value::Null, &responses).unwrap();
        assert_eq!(response.status, Status::Succeeded);
        assert!(response.failure_info.is_none());
    }

    #[test]
    fn one_failed_child_fails_the_fork() {
        let app_failure = FailureInfo::new("y broke").with_type(FailureType::ApplicationFailure);
        let responses = BTreeMap::from([
            ("x".to_string(), child("x", Status::Succeeded, None)),
            ("y".to_string(), child("y", Status::Failed, Some(app_failure))),
        ]);
        let response = ForkStep.handle_children_response(&ctx(), &Value::Null, &responses).unwrap();
        assert_eq!(response.status, Status::Failed);
        assert_eq!(
            response.failure_info.unwrap().all_failure_types(),
            BTreeSet::from([FailureType::ApplicationFailure])
        );
    }

    #[test]
    fn worst_status_wins_and_failures_concatenate() {
        let children = vec![
            child("a", Status::Skipped, None),
            child("b", Status::Aborted, Some(FailureInfo::new("aborted"))),
            child("c", Status::Expired, Some(FailureInfo::new("late").with_type(FailureType::TimeoutFailure))),
        ];
        let response = aggregate_children(&children);
        assert_eq!(response.status, Status::Aborted);
        let info = response.failure_info.unwrap();
        assert_eq!(info.error_message, "aborted; late");
        assert!(info.failure_types.contains(&FailureType::TimeoutFailure));
    }
}
