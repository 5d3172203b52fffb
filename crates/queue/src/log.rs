//! Append-only ordered log with consumer-group checkpoints.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use crate::QueueError;

/// One record of the log.  Offsets are global to the log and start at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub offset: u64,
    /// Ordering key, e.g. the plan execution id.
    pub key: String,
    pub payload: Value,
    pub timestamp_ms: i64,
}

impl LogRecord {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Default)]
struct LogState {
    records: Vec<LogRecord>,
    /// Consumer group → next offset to deliver.
    checkpoints: HashMap<String, u64>,
}

#[derive(Debug)]
pub struct EventLog {
    name: String,
    state: RwLock<LogState>,
    appended: Notify,
}

impl EventLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(LogState::default()),
            appended: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a record and wake waiting consumers.  Returns its offset.
    pub async fn append(&self, key: impl Into<String>, payload: Value) -> u64 {
        let offset = {
            let mut state = self.state.write().await;
            let offset = state.records.len() as u64;
            state.records.push(LogRecord {
                offset,
                key: key.into(),
                payload,
                timestamp_ms: Utc::now().timestamp_millis(),
            });
            offset
        };
        self.appended.notify_waiters();
        offset
    }

    pub async fn append_json<T: Serialize>(
        &self,
        key: impl Into<String>,
        message: &T,
    ) -> Result<u64, QueueError> {
        let payload = serde_json::to_value(message)?;
        Ok(self.append(key, payload).await)
    }

    /// Offset the next appended record will get.
    pub async fn end_offset(&self) -> u64 {
        self.state.read().await.records.len() as u64
    }

    /// Up to `limit` records starting at `from`.
    pub async fn read(&self, from: u64, limit: usize) -> Vec<LogRecord> {
        let state = self.state.read().await;
        state
            .records
            .iter()
            .skip(from as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Up to `limit` records with `key`, at or after offset `from`.
    pub async fn read_key(&self, key: &str, from: u64, limit: usize) -> Vec<LogRecord> {
        let state = self.state.read().await;
        state
            .records
            .iter()
            .skip(from as usize)
            .filter(|r| r.key == key)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Next offset to deliver to `group`; 0 for a group that never committed.
    pub async fn checkpoint(&self, group: &str) -> u64 {
        self.state
            .read()
            .await
            .checkpoints
            .get(group)
            .copied()
            .unwrap_or(0)
    }

    /// Record that `group` has processed everything before `next_offset`.
    ///
    /// Checkpoints only move forward; an older commit is ignored.
    pub async fn commit(&self, group: &str, next_offset: u64) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let end = state.records.len() as u64;
        if next_offset > end {
            return Err(QueueError::OffsetOutOfRange {
                log: self.name.clone(),
                offset: next_offset,
                end,
            });
        }
        let checkpoint = state.checkpoints.entry(group.to_owned()).or_insert(0);
        if next_offset < *checkpoint {
            debug!(
                "log '{}': ignoring stale commit {} < {} for group '{}'",
                self.name, next_offset, checkpoint, group
            );
        } else {
            *checkpoint = next_offset;
        }
        Ok(())
    }

    /// Resolve once the log holds a record at `offset`.
    pub async fn wait_for(&self, offset: u64) {
        loop {
            let notified = self.appended.notified();
            if self.end_offset().await > offset {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn offsets_are_sequential_and_keyed_reads_filter() {
        let log = EventLog::new("events");
        assert_eq!(log.append("pe-1", json!(1)).await, 0);
        assert_eq!(log.append("pe-2", json!(2)).await, 1);
        assert_eq!(log.append("pe-1", json!(3)).await, 2);

        let records = log.read_key("pe-1", 0, 10).await;
        let payloads: Vec<_> = records.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(1), json!(3)]);
        assert_eq!(log.read(1, 1).await[0].offset, 1);
    }

    #[tokio::test]
    async fn checkpoints_move_forward_only() {
        let log = EventLog::new("events");
        for n in 0..3 {
            log.append("k", json!(n)).await;
        }
        log.commit("g", 2).await.unwrap();
        log.commit("g", 1).await.unwrap();
        assert_eq!(log.checkpoint("g").await, 2);
        assert_eq!(log.checkpoint("other").await, 0);
        assert!(matches!(
            log.commit("g", 9).await,
            Err(QueueError::OffsetOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn wait_for_wakes_on_append() {
        let log = Arc::new(EventLog::new("events"));
        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.wait_for(0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        log.append("k", json!("hello")).await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
