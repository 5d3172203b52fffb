//! Step-level error types.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

use crate::{FailureInfo, FailureType};

/// Errors returned by the external Task Executor.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TaskError {
    /// The task ran and failed; carries the typed failure tags it reported.
    #[error("task failed: {message}")]
    Failed {
        message: String,
        failure_types: BTreeSet<FailureType>,
    },

    /// The task did not finish within its timeout.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The executor could not accept the task (no capacity, no agent, ...).
    #[error("task executor unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by a step's execution hooks.
///
/// The engine never propagates these to the plan: they are converted into an
/// `ERRORED` step response (see [`StepError::failure_info`]) and handed to the
/// adviser like any other failure.
#[derive(Debug, Error)]
pub enum StepError {
    /// Step parameters could not be interpreted.
    #[error("invalid step parameters: {0}")]
    InvalidParameters(String),

    /// The ambiance is missing information the step requires.
    #[error("invalid ambiance: {0}")]
    InvalidAmbiance(String),

    /// Propagated from the Task Executor.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Anything else a step implementation wants to surface.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    /// Failure info describing this error, typed where the source is.
    pub fn failure_info(&self) -> FailureInfo {
        let info = FailureInfo::new(self.to_string());
        match self {
            Self::Task(TaskError::Failed { failure_types, .. }) => failure_types
                .iter()
                .fold(info, |info, ty| info.with_type(*ty)),
            Self::Task(TaskError::Timeout(_)) => info.with_type(FailureType::TimeoutFailure),
            Self::Task(TaskError::Unavailable(_)) => {
                info.with_type(FailureType::DelegateProvisioningFailure)
            }
            Self::InvalidParameters(_) | Self::InvalidAmbiance(_) | Self::Other(_) => info,
        }
    }
}
