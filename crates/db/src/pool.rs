//! The shared in-memory document store.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use crate::models::{NodeExecution, OutcomeRecord, PlanExecution};

/// Handle to the store shared across the whole application.
pub type DbPool = Arc<Store>;

/// One map per collection.  Every repository function takes the collection
/// lock for the duration of a single operation, which makes each operation
/// atomic with respect to the others on the same collection.
#[derive(Debug, Default)]
pub struct Store {
    pub(crate) node_executions: RwLock<HashMap<String, NodeExecution>>,
    pub(crate) plan_executions: RwLock<HashMap<String, PlanExecution>>,
    pub(crate) outcomes: RwLock<HashMap<String, OutcomeRecord>>,
    pub(crate) summaries: RwLock<HashMap<String, Value>>,
}

/// Create a fresh, empty store.
pub fn create_pool() -> DbPool {
    info!("Creating in-memory execution store");
    Arc::new(Store::default())
}
