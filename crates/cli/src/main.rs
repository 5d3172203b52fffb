//! `pipeline-orchestrator` CLI entry-point.
//!
//! Available sub-commands:
//! - `plan`: assemble a pipeline YAML file and print the plan.
//! - `run` : assemble and execute a pipeline against a local task executor
//!   that answers every task with success.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use engine::plan_creation::creators::{FORK_KIND, PIPELINE_KIND, STAGES_KIND, STAGE_KIND, STEPS_KIND};
use engine::{EngineConfig, GenericPlanCreatorService, OrchestrationEngine, Plan, PlanCreationMergeService};
use steps::mock::MockTaskExecutor;
use steps::{Step, TaskResponse, TaskStep};

#[derive(Parser)]
#[command(
    name = "pipeline-orchestrator",
    about = "Pipeline assembly and orchestration engine",
    version
)]
struct Cli {
    /// Engine configuration (YAML).  Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble a pipeline and print the resulting plan as JSON.
    Plan {
        /// Path to the pipeline YAML file.
        path: PathBuf,
    },
    /// Assemble and execute a pipeline.
    Run {
        /// Path to the pipeline YAML file.
        path: PathBuf,
    },
}

const BUILT_IN_KINDS: [&str; 5] = [PIPELINE_KIND, STAGES_KIND, STAGE_KIND, STEPS_KIND, FORK_KIND];

async fn assemble(path: &PathBuf, config: &EngineConfig) -> anyhow::Result<Plan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read pipeline {}", path.display()))?;
    let creator = PlanCreationMergeService::new(vec![Arc::new(GenericPlanCreatorService)], config.clone());
    Ok(creator.create_plan(&content).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Plan { path } => {
            let plan = assemble(&path, &config).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Run { path } => {
            let plan = assemble(&path, &config).await?;
            let executor = Arc::new(MockTaskExecutor::auto_responding(TaskResponse::succeeded(
                serde_json::json!({ "exitCode": 0 }),
            )));

            let mut builder = OrchestrationEngine::builder(db::create_pool(), executor).config(config);
            for node in plan.nodes.values() {
                let kind = node.step_type.kind.as_str();
                if !BUILT_IN_KINDS.contains(&kind) {
                    builder = builder.register_step(kind, Step::Task(Arc::new(TaskStep)));
                }
            }
            let engine = builder.build();

            let plan_execution_id = engine.start_execution(plan, BTreeMap::new()).await?;
            let status = engine.await_completion(&plan_execution_id).await?;
            info!("plan execution {} finished: {}", plan_execution_id, status);
            println!("{status}");
        }
    }
    Ok(())
}
