//! `steps` crate: the contracts every step implementation fulfils.
//!
//! The engine and individual step modules both depend on this crate, so the
//! execution context ([`Ambiance`]), the status model, step responses and the
//! external Task Executor contract all live here.  Built-in steps that the
//! engine itself relies on (fork/join and section chains) are provided too.

pub mod ambiance;
pub mod error;
pub mod failure;
pub mod fork;
pub mod mock;
pub mod response;
pub mod section;
pub mod status;
pub mod task;
pub mod traits;

pub use ambiance::{Ambiance, Level};
pub use error::{StepError, TaskError};
pub use failure::{FailureData, FailureInfo, FailureType};
pub use fork::{aggregate_children, ForkStep};
pub use response::{ChildOutcome, ResponseData, StepOutcome, StepResponse, UnitProgress};
pub use section::SectionStep;
pub use status::{ExecutionMode, Status, StepCategory, StepType};
pub use task::{TaskCallback, TaskExecutor, TaskNotification, TaskRequest, TaskResponse, TaskStep};
pub use traits::{
    AsyncExecutable, ChildExecutable, ChildrenExecutable, Step, StepContext, SyncExecutable,
    TaskChainExecutable, TaskExecutable,
};
