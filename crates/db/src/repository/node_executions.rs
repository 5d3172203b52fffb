//! Node-execution repository functions.
//!
//! [`update_status`] is the only way a node's `status` changes.  It is a
//! conditional update: the caller names the statuses it expects the record to
//! be in, and an update whose precondition no longer holds returns `Ok(None)`
//! (someone else already moved the node) instead of an error.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use steps::{FailureInfo, FailureType, Status};
use tracing::debug;

use crate::{models::NodeExecution, DbError, DbPool};

const COLLECTION: &str = "node_execution";

/// Insert a new node execution record.
pub async fn insert_node_execution(
    pool: &DbPool,
    node_execution: NodeExecution,
) -> Result<NodeExecution, DbError> {
    let mut map = pool.node_executions.write().await;
    if map.contains_key(&node_execution.uuid) {
        return Err(DbError::DuplicateKey {
            collection: COLLECTION,
            key: node_execution.uuid,
        });
    }
    map.insert(node_execution.uuid.clone(), node_execution.clone());
    Ok(node_execution)
}

pub async fn get_node_execution(pool: &DbPool, id: &str) -> Result<NodeExecution, DbError> {
    pool.node_executions
        .read()
        .await
        .get(id)
        .cloned()
        .ok_or_else(|| DbError::not_found(COLLECTION, id))
}

/// Conditionally move a node execution to `new_status`.
///
/// The precondition holds when the current status is in `allowed`, or, with
/// an empty `allowed`, when the current status is not final.  The status
/// machine must also permit the move.  `mutator` runs under the same lock and
/// may set any field except `status`.
pub async fn update_status<F>(
    pool: &DbPool,
    id: &str,
    new_status: Status,
    allowed: &[Status],
    mutator: F,
) -> Result<Option<NodeExecution>, DbError>
where
    F: FnOnce(&mut NodeExecution) + Send,
{
    let mut map = pool.node_executions.write().await;
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
            "stale transition of node execution {} ({} -> {}) ignored",
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

/// Update fields other than `status`.
pub async fn update<F>(pool: &DbPool, id: &str, mutator: F) -> Result<NodeExecution, DbError>
where
    F: FnOnce(&mut NodeExecution) + Send,
{
    let mut map = pool.node_executions.write().await;
    let record = map
        .get_mut(id)
        .ok_or_else(|| DbError::not_found(COLLECTION, id))?;
    let status = record.status;
    mutator(record);
    record.status = status;
    record.version += 1;
    Ok(record.clone())
}

/// Move every non-final node of a plan execution to `ERRORED`.
///
/// Returns whether any record changed.
pub async fn error_out_active_nodes(
    pool: &DbPool,
    plan_execution_id: &str,
) -> Result<bool, DbError> {
    let mut map = pool.node_executions.write().await;
    let now = Utc::now();
    let mut changed = false;
    for record in map
        .values_mut()
        .filter(|ne| {
            ne.plan_execution_id() == plan_execution_id && ne.status.can_transition_to(Status::Errored)
        })
    {
        record.status = Status::Errored;
        record.end_ts = Some(now);
        record
            .failure_info
            .get_or_insert_with(|| {
                FailureInfo::new("plan execution errored out").with_type(FailureType::UnknownFailure)
            });
        record.version += 1;
        changed = true;
    }
    Ok(changed)
}

/// Flag an attempt as superseded by a retry.  Returns `false` if missing.
pub async fn mark_retried(pool: &DbPool, id: &str) -> Result<bool, DbError> {
    let mut map = pool.node_executions.write().await;
    Ok(match map.get_mut(id) {
        Some(record) => {
            record.old_retry = true;
            record.version += 1;
            true
        }
        None => false,
    })
}

fn sorted(mut records: Vec<NodeExecution>) -> Vec<NodeExecution> {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uuid.cmp(&b.uuid)));
    records
}

/// All executions whose `parent_id` is `parent_id`, oldest first.
pub async fn fetch_children(pool: &DbPool, parent_id: &str) -> Result<Vec<NodeExecution>, DbError> {
    let map = pool.node_executions.read().await;
    Ok(sorted(
        map.values()
            .filter(|ne| ne.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect(),
    ))
}

pub async fn count_by_parent_and_status(
    pool: &DbPool,
    parent_id: &str,
    statuses: &[Status],
) -> Result<usize, DbError> {
    let map = pool.node_executions.read().await;
    Ok(map
        .values()
        .filter(|ne| ne.parent_id.as_deref() == Some(parent_id) && statuses.contains(&ne.status))
        .count())
}

/// Every execution of a plan execution, oldest first.
pub async fn fetch_by_plan_execution(
    pool: &DbPool,
    plan_execution_id: &str,
) -> Result<Vec<NodeExecution>, DbError> {
    let map = pool.node_executions.read().await;
    Ok(sorted(
        map.values()
            .filter(|ne| ne.plan_execution_id() == plan_execution_id)
            .cloned()
            .collect(),
    ))
}

/// Non-final executions of a plan execution, oldest first.
pub async fn fetch_active(
    pool: &DbPool,
    plan_execution_id: &str,
) -> Result<Vec<NodeExecution>, DbError> {
    let mut records = fetch_by_plan_execution(pool, plan_execution_id).await?;
    records.retain(|ne| !ne.status.is_final());
    Ok(records)
}

/// Latest attempt of a plan node that has not been superseded by a retry.
pub async fn get_by_plan_node(
    pool: &DbPool,
    plan_execution_id: &str,
    plan_node_id: &str,
) -> Result<Option<NodeExecution>, DbError> {
    let records = fetch_by_plan_execution(pool, plan_execution_id).await?;
    Ok(records
        .into_iter()
        .filter(|ne| ne.node_id == plan_node_id && !ne.old_retry)
        .last())
}

/// Latest non-retried attempt of the node with `identifier`.
pub async fn get_by_identifier(
    pool: &DbPool,
    plan_execution_id: &str,
    identifier: &str,
) -> Result<Option<NodeExecution>, DbError> {
    let records = fetch_by_plan_execution(pool, plan_execution_id).await?;
    Ok(records
        .into_iter()
        .filter(|ne| ne.identifier == identifier && !ne.old_retry)
        .last())
}

/// Distinct statuses of the non-final executions of a plan execution.
pub async fn fetch_non_final_statuses(
    pool: &DbPool,
    plan_execution_id: &str,
) -> Result<BTreeSet<Status>, DbError> {
    let map = pool.node_executions.read().await;
    Ok(map
        .values()
        .filter(|ne| ne.plan_execution_id() == plan_execution_id && !ne.status.is_final())
        .map(|ne| ne.status)
        .collect())
}

/// `RUNNING` executions whose expiry lies at or before `now`.
pub async fn fetch_expired(pool: &DbPool, now: DateTime<Utc>) -> Result<Vec<NodeExecution>, DbError> {
    let map = pool.node_executions.read().await;
    Ok(sorted(
        map.values()
            .filter(|ne| {
                ne.status == Status::Running && ne.expiry_ts.map(|ts| ts <= now).unwrap_or(false)
            })
            .cloned()
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;
    use steps::{Ambiance, StepCategory, StepType};

    fn node(id: &str, plan_execution_id: &str) -> NodeExecution {
        NodeExecution::queued(
            id,
            Ambiance::new(plan_execution_id, "plan", Default::default()),
            format!("pn-{id}"),
            id,
            StepType::new("Mock", StepCategory::Step),
        )
    }

    #[tokio::test]
    async fn update_status_enforces_precondition() {
        let pool = create_pool();
        insert_node_execution(&pool, node("a", "pe")).await.unwrap();

        let updated = update_status(&pool, "a", Status::Running, &[Status::Queued], |_| {})
            .await
            .unwrap();
        assert_eq!(updated.unwrap().status, Status::Running);

        let stale = update_status(&pool, "a", Status::Running, &[Status::Queued], |_| {})
            .await
            .unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn final_status_never_changes() {
        let pool = create_pool();
        insert_node_execution(&pool, node("a", "pe")).await.unwrap();
        update_status(&pool, "a", Status::Succeeded, &[], |_| {})
            .await
            .unwrap()
            .unwrap();

        let moved = update_status(&pool, "a", Status::Running, &[], |_| {}).await.unwrap();
        assert!(moved.is_none());
        let record = get_node_execution(&pool, "a").await.unwrap();
        assert_eq!(record.status, Status::Succeeded);
        assert!(record.end_ts.is_some());
    }

    #[tokio::test]
    async fn error_out_only_moves_nodes_that_may_error() {
        let pool = create_pool();
        for id in ["queued", "running", "suspended", "done"] {
            insert_node_execution(&pool, node(id, "pe")).await.unwrap();
        }
        insert_node_execution(&pool, node("other", "pe-2")).await.unwrap();
        update_status(&pool, "running", Status::Running, &[], |_| {}).await.unwrap();
        update_status(&pool, "suspended", Status::Running, &[], |_| {}).await.unwrap();
        update_status(&pool, "suspended", Status::Suspended, &[], |_| {}).await.unwrap();
        update_status(&pool, "done", Status::Succeeded, &[], |_| {}).await.unwrap();

        assert!(error_out_active_nodes(&pool, "pe").await.unwrap());

        for id in ["queued", "running", "suspended"] {
            let record = get_node_execution(&pool, id).await.unwrap();
            assert_eq!(record.status, Status::Errored, "{id}");
            assert!(record.end_ts.is_some());
            assert!(record.failure_info.is_some());
        }
        assert_eq!(get_node_execution(&pool, "done").await.unwrap().status, Status::Succeeded);
        assert_eq!(get_node_execution(&pool, "other").await.unwrap().status, Status::Queued);
        assert!(!error_out_active_nodes(&pool, "pe").await.unwrap());
    }

    #[tokio::test]
    async fn mutator_cannot_change_status() {
        let pool = create_pool();
        insert_node_execution(&pool, node("a", "pe")).await.unwrap();
        let record = update(&pool, "a", |ne| {
            ne.status = Status::Succeeded;
            ne.task_id = Some("t-1".into());
        })
        .await
        .unwrap();
        assert_eq!(record.status, Status::Queued);
        assert_eq!(record.task_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn concurrent_duplicate_transitions_have_one_winner() {
        let pool = create_pool();
        insert_node_execution(&pool, node("a", "pe")).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    update_status(&pool, "a", Status::Succeeded, &[Status::Queued], |_| {})
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn error_out_touches_only_active_nodes_of_the_plan() {
        let pool = create_pool();
        insert_node_execution(&pool, node("a", "pe")).await.unwrap();
        insert_node_execution(&pool, node("b", "pe")).await.unwrap();
        insert_node_execution(&pool, node("c", "other")).await.unwrap();
        update_status(&pool, "b", Status::Succeeded, &[], |_| {})
            .await
            .unwrap();

        assert!(error_out_active_nodes(&pool, "pe").await.unwrap());
        assert_eq!(get_node_execution(&pool, "a").await.unwrap().status, Status::Errored);
        assert_eq!(get_node_execution(&pool, "b").await.unwrap().status, Status::Succeeded);
        assert_eq!(get_node_execution(&pool, "c").await.unwrap().status, Status::Queued);
        assert!(fetch_non_final_statuses(&pool, "pe").await.unwrap().is_empty());
        assert!(!error_out_active_nodes(&pool, "pe").await.unwrap());
    }

    #[tokio::test]
    async fn children_are_counted_by_status() {
        let pool = create_pool();
        for id in ["x", "y"] {
            let mut child = node(id, "pe");
            child.parent_id = Some("fork".into());
            insert_node_execution(&pool, child).await.unwrap();
        }
        update_status(&pool, "x", Status::Failed, &[], |_| {}).await.unwrap();

        assert_eq!(fetch_children(&pool, "fork").await.unwrap().len(), 2);
        assert_eq!(
            count_by_parent_and_status(&pool, "fork", &[Status::Failed]).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn retried_attempts_are_skipped_by_plan_node_lookup() {
        let pool = create_pool();
        let first = node("a1", "pe");
        let mut second = node("a2", "pe");
        second.node_id = first.node_id.clone();
        second.retry_ids = vec!["a1".into()];
        insert_node_execution(&pool, first).await.unwrap();
        insert_node_execution(&pool, second).await.unwrap();

        assert!(mark_retried(&pool, "a1").await.unwrap());
        assert!(!mark_retried(&pool, "missing").await.unwrap());

        let latest = get_by_plan_node(&pool, "pe", "pn-a1").await.unwrap().unwrap();
        assert_eq!(latest.uuid, "a2");
    }
}
