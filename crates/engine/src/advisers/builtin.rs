use std::collections::BTreeSet;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use steps::FailureType;

use super::{
    Adviser, AdviserResponse, AdvisingEvent, END_PLAN, IGNORE, MARK_FAILED, NEXT_STEP, RETRY,
    ROLLBACK,
};
use crate::EngineError;

fn parameters<T: DeserializeOwned>(adviser: &str, event: &AdvisingEvent<'_>) -> Result<T, EngineError> {
    let raw = if event.parameters.is_null() {
        serde_json::json!({})
    } else {
        event.parameters.clone()
    };
    serde_json::from_value(raw)
        .map_err(|e| EngineError::InvalidPlan(format!("{adviser} parameters: {e}")))
}

/// Broken status whose failure tags intersect `filter` (empty matches all).
fn matches_failure(event: &AdvisingEvent<'_>, filter: &BTreeSet<FailureType>) -> bool {
    event.node_execution.status.is_broken()
        && (filter.is_empty() || !filter.is_disjoint(&event.failure_types))
}

/// Whether a broken node matches the `failure_types` filter of `adviser`.
/// A malformed filter is an invalid plan, never a match-all.
fn failure_filter_matches(adviser: &str, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
    let filter: FailureFilter = parameters(adviser, event)?;
    Ok(matches_failure(event, &filter.failure_types))
}

#[derive(Debug, Default, Deserialize)]
struct FailureFilter {
    #[serde(default)]
    failure_types: BTreeSet<FailureType>,
}

#[derive(Debug, Default, Deserialize)]
struct NextParams {
    #[serde(default)]
    next_node_id: Option<String>,
}

// ---------------------------------------------------------------------------

/// Advances on a positive status.
#[derive(Debug, Default)]
pub struct NextStepAdviser;

impl Adviser for NextStepAdviser {
    fn adviser_type(&self) -> &str {
        NEXT_STEP
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        Ok(event.node_execution.effective_status().is_positive())
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, EngineError> {
        let params: NextParams = parameters(NEXT_STEP, event)?;
        Ok(AdviserResponse::NextStep {
            next_node_id: params.next_node_id,
        })
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RetryParams {
    retry_count: usize,
    /// Milliseconds; attempt `n` waits `wait_intervals[n]`, the last value
    /// repeats.
    #[serde(default)]
    wait_intervals: Vec<u64>,
    #[serde(default = "default_after_retry")]
    after_retry: String,
    #[serde(default)]
    next_node_id: Option<String>,
}

fn default_after_retry() -> String {
    MARK_FAILED.to_owned()
}

/// Re-runs a failed node up to `retry_count` times, then applies
/// `after_retry`.
#[derive(Debug, Default)]
pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn adviser_type(&self) -> &str {
        RETRY
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        failure_filter_matches(RETRY, event)
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, EngineError> {
        let params: RetryParams = parameters(RETRY, event)?;
        let attempt = event.node_execution.retry_ids.len();
        if attempt < params.retry_count {
            let wait_ms = params
                .wait_intervals
                .get(attempt)
                .or(params.wait_intervals.last())
                .copied()
                .unwrap_or(0);
            return Ok(AdviserResponse::Retry {
                wait: Duration::from_millis(wait_ms),
            });
        }
        Ok(match params.after_retry.as_str() {
            IGNORE => AdviserResponse::IgnoreFailure {
                next_node_id: params.next_node_id,
            },
            END_PLAN => AdviserResponse::EndPlan,
            _ => AdviserResponse::MarkFailed,
        })
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct IgnoreAdviser;

impl Adviser for IgnoreAdviser {
    fn adviser_type(&self) -> &str {
        IGNORE
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        failure_filter_matches(IGNORE, event)
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, EngineError> {
        let params: NextParams = parameters(IGNORE, event)?;
        Ok(AdviserResponse::IgnoreFailure {
            next_node_id: params.next_node_id,
        })
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MarkFailedAdviser;

impl Adviser for MarkFailedAdviser {
    fn adviser_type(&self) -> &str {
        MARK_FAILED
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        failure_filter_matches(MARK_FAILED, event)
    }

    fn advise(&self, _event: &AdvisingEvent<'_>) -> Result<AdviserResponse, EngineError> {
        Ok(AdviserResponse::MarkFailed)
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct EndPlanAdviser;

impl Adviser for EndPlanAdviser {
    fn adviser_type(&self) -> &str {
        END_PLAN
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        failure_filter_matches(END_PLAN, event)
    }

    fn advise(&self, _event: &AdvisingEvent<'_>) -> Result<AdviserResponse, EngineError> {
        Ok(AdviserResponse::EndPlan)
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RollbackParams {
    rollback_node_id: String,
}

#[derive(Debug, Default)]
pub struct RollbackAdviser;

impl Adviser for RollbackAdviser {
    fn adviser_type(&self) -> &str {
        ROLLBACK
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>) -> Result<bool, EngineError> {
        failure_filter_matches(ROLLBACK, event)
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, EngineError> {
        let params: RollbackParams = parameters(ROLLBACK, event)?;
        Ok(AdviserResponse::Rollback {
            rollback_node_id: params.rollback_node_id,
        })
    }
}
