//! Outcome repository functions.

use crate::{models::OutcomeRecord, DbError, DbPool};

const COLLECTION: &str = "outcome";

/// Store an outcome.  A second outcome with the same name and group in the
/// same scope of the same plan execution is rejected.
pub async fn insert_outcome(pool: &DbPool, record: OutcomeRecord) -> Result<OutcomeRecord, DbError> {
    let mut stored = insert_outcomes(pool, vec![record]).await?;
    stored.pop().ok_or_else(|| DbError::not_found(COLLECTION, "<empty batch>"))
}

/// Store a batch of outcomes, all or none.  The batch is rejected when any
/// record clashes with a stored outcome or with another record of the batch.
pub async fn insert_outcomes(
    pool: &DbPool,
    records: Vec<OutcomeRecord>,
) -> Result<Vec<OutcomeRecord>, DbError> {
    let mut map = pool.outcomes.write().await;
    for (i, record) in records.iter().enumerate() {
        let same_slot = |other: &OutcomeRecord| {
            other.plan_execution_id == record.plan_execution_id
                && other.scope_key == record.scope_key
                && other.name == record.name
                && other.group == record.group
        };
        let clash = map.values().any(same_slot)
            || records[..i].iter().any(same_slot)
            || map.contains_key(&record.uuid);
        if clash {
            return Err(DbError::DuplicateKey {
                collection: COLLECTION,
                key: format!("{}/{}", record.scope_key, record.name),
            });
        }
    }
    for record in &records {
        map.insert(record.uuid.clone(), record.clone());
    }
    Ok(records)
}

pub async fn get_outcome(pool: &DbPool, instance_id: &str) -> Result<OutcomeRecord, DbError> {
    pool.outcomes
        .read()
        .await
        .get(instance_id)
        .cloned()
        .ok_or_else(|| DbError::not_found(COLLECTION, instance_id))
}

/// Outcomes of a plan execution, oldest first.
pub async fn fetch_by_plan_execution(
    pool: &DbPool,
    plan_execution_id: &str,
) -> Result<Vec<OutcomeRecord>, DbError> {
    let map = pool.outcomes.read().await;
    let mut records: Vec<OutcomeRecord> = map
        .values()
        .filter(|o| o.plan_execution_id == plan_execution_id)
        .cloned()
        .collect();
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(records)
}
