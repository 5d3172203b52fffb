//! Plan-execution repository functions.

use chrono::Utc;
use steps::Status;
use tracing::debug;

use crate::{models::PlanExecution, DbError, DbPool};

const COLLECTION: &str = "plan_execution";

pub async fn insert_plan_execution(
    pool: &DbPool,
    plan_execution: PlanExecution,
) -> Result<PlanExecution, DbError> {
    let mut map = pool.plan_executions.write().await;
    if map.contains_key(&plan_execution.uuid) {
        return Err(DbError::DuplicateKey {
            collection: COLLECTION,
            key: plan_execution.uuid,
        });
    }
    map.insert(plan_execution.uuid.clone(), plan_execution.clone());
    Ok(plan_execution)
}

pub async fn get_plan_execution(pool: &DbPool, id: &str) -> Result<PlanExecution, DbError> {
    pool.plan_executions
        .read()
        .await
        .get(id)
        .cloned()
        .ok_or_else(|| DbError::not_found(COLLECTION, id))
}

/// Conditional status update with the same contract as
/// [`crate::repository::node_executions::update_status`].
pub async fn update_plan_status<F>(
    pool: &DbPool,
    id: &str,
    new_status: Status,
    allowed: &[Status],
    mutator: F,
) -> Result<Option<PlanExecution>, DbError>
where
    F: FnOnce(&mut PlanExecution) + Send,
{
    let mut map = pool.plan_executions.write().await;
    let record = map
        .get_mut(id)
        .ok_or_else(|| DbError::not_found(COLLECTION, id))?;

    let current = record.status;
    let precondition = if allowed.is_empty() {
        !current.is_final()
    } else {
        allowed.contains(&current)
    };
    if !precondition || !current.can_transition_to(new_status) {
        debug!(
            "stale transition of plan execution {} ({} -> {}) ignored",
            id, current, new_status
        );
        return Ok(None);
    }

    mutator(record);
    record.status = new_status;
    if new_status.is_final() && record.end_ts.is_none() {
        record.end_ts = Some(Utc::now());
    }
    record.version += 1;
    Ok(Some(record.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;

    #[tokio::test]
    async fn plan_status_moves_once_to_final() {
        let pool = create_pool();
        insert_plan_execution(&pool, PlanExecution::running("pe", "plan"))
            .await
            .unwrap();

        let ended = update_plan_status(&pool, "pe", Status::Succeeded, &[], |_| {})
            .await
            .unwrap()
            .unwrap();
        assert!(ended.end_ts.is_some());

        let again = update_plan_status(&pool, "pe", Status::Failed, &[], |_| {})
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let pool = create_pool();
        insert_plan_execution(&pool, PlanExecution::running("pe", "plan"))
            .await
            .unwrap();
        let err = insert_plan_execution(&pool, PlanExecution::running("pe", "plan"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateKey { .. }));
    }
}
