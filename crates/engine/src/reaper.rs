//! Expiry reaper: waiting nodes past their `expiry_ts` become `EXPIRED`.

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use db::repository::node_executions;
use steps::{FailureInfo, FailureType, Status, StepResponse};

use crate::executor::OrchestrationEngine;
use crate::EngineError;

impl OrchestrationEngine {
    /// Expire every `RUNNING` node whose expiry is at or before `now`.
    /// Returns how many were expired.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let expired = node_executions::fetch_expired(&self.inner.pool, now).await?;
        let mut reaped = 0;
        for node_execution in expired {
            warn!(
                "node execution {} ('{}') expired",
                node_execution.uuid, node_execution.identifier
            );
            self.release(&node_execution).await;
            let mut response = StepResponse::with_status(Status::Expired);
            response.failure_info = Some(
                FailureInfo::new(format!("'{}' timed out", node_execution.identifier))
                    .with_type(FailureType::TimeoutFailure),
            );
            self.handle_step_response(&node_execution, response).await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Run [`OrchestrationEngine::reap_expired`] every
    /// `config.reaper_interval` until `shutdown` flips to `true`.
    pub fn spawn_reaper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.inner.config.reaper_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.reap_expired(Utc::now()).await {
                            Ok(0) => {}
                            Ok(n) => debug!("reaper expired {} node executions", n),
                            Err(e) => error!("reaper pass failed: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("reaper stopped");
        })
    }
}
