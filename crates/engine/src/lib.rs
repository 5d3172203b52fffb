//! `engine` crate: plan assembly and the orchestration engine.
//!
//! Pipeline YAML is assembled into a [`Plan`] by plan-creator plugins
//! ([`plan_creation`]), then executed by the [`OrchestrationEngine`]:
//! steps run through facilitators, advisers decide what follows each step,
//! and every status change fans out to event handlers and the execution
//! summary.

pub mod advisers;
pub mod config;
pub mod dag;
pub mod error;
pub mod events;
pub mod executor;
pub mod facilitator;
pub mod interrupts;
pub mod models;
pub mod outcomes;
pub mod plan_creation;
pub mod reaper;
pub mod summary;
pub mod waiter;

pub use advisers::{Adviser, AdviserRegistry, AdviserResponse};
pub use config::EngineConfig;
pub use dag::validate_plan;
pub use error::EngineError;
pub use events::{EventBus, EventBusBuilder, OrchestrationEvent, OrchestrationEventType};
pub use executor::{EngineBuilder, OrchestrationEngine};
pub use facilitator::{Facilitator, FacilitatorResponse, StaticFacilitator};
pub use interrupts::Interrupt;
pub use models::{AdviserObtainment, Plan, PlanNode};
pub use plan_creation::{GenericPlanCreatorService, PlanCreationMergeService, PlanCreatorService};
pub use summary::{ExecutionSummaryUpdater, ModuleInfoProvider};
