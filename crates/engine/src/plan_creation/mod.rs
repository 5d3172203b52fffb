//! Plan assembly: pipeline YAML in, validated [`Plan`](crate::Plan) out.

pub mod creator;
pub mod creators;
pub mod merge;
pub mod yaml;

pub use creator::{Dependencies, PlanCreationResponse, PlanCreatorService};
pub use creators::GenericPlanCreatorService;
pub use merge::PlanCreationMergeService;
pub use yaml::YamlField;
