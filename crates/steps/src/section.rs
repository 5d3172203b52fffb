//! Section step: a parent that runs one child chain and reports its end.
//!
//! Pipelines, stages and step lists are all sections.  Parameters:
//! `{"child_node_id": "<plan node id>"}`.

use serde_json::Value;

use crate::{ChildExecutable, ChildOutcome, StepContext, StepError, StepResponse};

#[derive(Debug, Default, Clone)]
pub struct SectionStep;

impl ChildExecutable for SectionStep {
    fn obtain_child(&self, _ctx: &StepContext, params: &Value) -> Result<String, StepError> {
        params
            .get("child_node_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| StepError::InvalidParameters("section requires `child_node_id`".into()))
    }

    fn handle_child_response(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        response: &ChildOutcome,
    ) -> Result<StepResponse, StepError> {
        let mut step_response = StepResponse::with_status(response.status);
        step_response.failure_info = response.failure_info.clone();
        step_response.unit_progress = response.unit_progress.clone();
        Ok(step_response)
    }
}
