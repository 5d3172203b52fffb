//! Execution-summary repository functions.
//!
//! Summaries are schemaless documents keyed by plan execution id and mutated
//! only through [`FieldPatch`]es.

use serde_json::Value;

use crate::{patch::apply_all, DbError, DbPool, FieldPatch};

const COLLECTION: &str = "execution_summary";

pub async fn insert_summary(
    pool: &DbPool,
    plan_execution_id: &str,
    document: Value,
) -> Result<(), DbError> {
    let mut map = pool.summaries.write().await;
    if map.contains_key(plan_execution_id) {
        return Err(DbError::DuplicateKey {
            collection: COLLECTION,
            key: plan_execution_id.to_owned(),
        });
    }
    map.insert(plan_execution_id.to_owned(), document);
    Ok(())
}

pub async fn get_summary(pool: &DbPool, plan_execution_id: &str) -> Result<Value, DbError> {
    pool.summaries
        .read()
        .await
        .get(plan_execution_id)
        .cloned()
        .ok_or_else(|| DbError::not_found(COLLECTION, plan_execution_id))
}

/// Apply `patches` atomically: either all of them land or none does.
pub async fn patch_summary(
    pool: &DbPool,
    plan_execution_id: &str,
    patches: &[FieldPatch],
) -> Result<(), DbError> {
    let mut map = pool.summaries.write().await;
    let document = map
        .get_mut(plan_execution_id)
        .ok_or_else(|| DbError::not_found(COLLECTION, plan_execution_id))?;
    apply_all(document, patches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;
    use serde_json::json;

    #[tokio::test]
    async fn concurrent_branch_patches_do_not_clobber() {
        let pool = create_pool();
        insert_summary(&pool, "pe", json!({ "status": "RUNNING", "layoutNodeMap": {} }))
            .await
            .unwrap();

        let handles: Vec<_> = ["s1", "s2", "s3"]
            .into_iter()
            .map(|stage| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let patches = vec![
                        FieldPatch::set(format!("layoutNodeMap.{stage}.status"), json!("SUCCEEDED")),
                        FieldPatch::add_to_set("modules", vec![json!("ci")]),
                    ];
                    patch_summary(&pool, "pe", &patches).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let doc = get_summary(&pool, "pe").await.unwrap();
        for stage in ["s1", "s2", "s3"] {
            assert_eq!(doc["layoutNodeMap"][stage]["status"], "SUCCEEDED");
        }
        assert_eq!(doc["modules"], json!(["ci"]));
        assert_eq!(doc["status"], "RUNNING");
    }

    #[tokio::test]
    async fn patching_unknown_summary_fails() {
        let pool = create_pool();
        let err = patch_summary(&pool, "missing", &[FieldPatch::set("status", json!("FAILED"))])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }
}
