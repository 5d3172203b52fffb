//! Message-listener framework over an [`EventLog`].
//!
//! A [`Consumer`] delivers the records of one log to one listener, in order,
//! on behalf of a consumer group.  A record is committed only once the
//! listener accepted it; a failing record is redelivered up to
//! `max_attempts` times and then skipped with an error log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{EventLog, LogRecord, QueueError};

#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn handle(&self, record: &LogRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl ConsumerConfig {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            batch_size: 100,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Delivery attempts of the record at the head of the group.
#[derive(Debug, Default)]
struct Attempts {
    offset: u64,
    count: u32,
}

pub struct Consumer {
    log: Arc<EventLog>,
    listener: Arc<dyn MessageListener>,
    config: ConsumerConfig,
    attempts: Mutex<Attempts>,
}

impl Consumer {
    pub fn new(log: Arc<EventLog>, listener: Arc<dyn MessageListener>, config: ConsumerConfig) -> Self {
        Self {
            log,
            listener,
            config,
            attempts: Mutex::new(Attempts::default()),
        }
    }

    /// Deliver one batch starting at the group checkpoint.
    ///
    /// Returns how many records were committed.  Stops at the first record
    /// the listener rejects, unless that record ran out of attempts.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let group = &self.config.group;
        let from = self.log.checkpoint(group).await;
        let batch = self.log.read(from, self.config.batch_size).await;
        let mut committed = 0;

        for record in &batch {
            match self.listener.handle(record).await {
                Ok(()) => {}
                Err(err) => {
                    let mut attempts = self.attempts.lock().await;
                    if attempts.offset != record.offset {
                        *attempts = Attempts {
                            offset: record.offset,
                            count: 0,
                        };
                    }
                    attempts.count += 1;
                    if attempts.count < self.config.max_attempts {
                        warn!(
                            "log '{}' group '{}': record {} failed (attempt {}/{}): {:#}",
                            self.log.name(),
                            group,
                            record.offset,
                            attempts.count,
                            self.config.max_attempts,
                            err
                        );
                        return Ok(committed);
                    }
                    error!(
                        "log '{}' group '{}': dropping record {} after {} attempts: {:#}",
                        self.log.name(),
                        group,
                        record.offset,
                        attempts.count,
                        err
                    );
                }
            }
            self.log.commit(group, record.offset + 1).await?;
            committed += 1;
        }
        Ok(committed)
    }

    /// Run until `shutdown` flips to `true`.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let delivered = match self.poll_once().await {
                    Ok(n) => n,
                    Err(err) => {
                        error!("consumer '{}' poll failed: {}", self.config.group, err);
                        0
                    }
                };
                if delivered > 0 {
                    continue;
                }

                let checkpoint = self.log.checkpoint(&self.config.group).await;
                let backlog = self.log.end_offset().await > checkpoint;
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.retry_backoff), if backlog => {}
                    _ = self.log.wait_for(checkpoint), if !backlog => {}
                }
            }
            debug!("consumer '{}' stopped", self.config.group);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<Value>>,
        fail_on: Option<Value>,
    }

    #[async_trait]
    impl MessageListener for Recorder {
        async fn handle(&self, record: &LogRecord) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(record.payload.clone());
            if self.fail_on.as_ref() == Some(&record.payload) {
                anyhow::bail!("poison record");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn group_resumes_from_checkpoint_after_restart() {
        let log = Arc::new(EventLog::new("events"));
        log.append("pe", json!(1)).await;
        log.append("pe", json!(2)).await;

        let first = Arc::new(Recorder::default());
        let consumer = Consumer::new(log.clone(), first.clone(), ConsumerConfig::new("observer"));
        assert_eq!(consumer.poll_once().await.unwrap(), 2);

        log.append("pe", json!(3)).await;

        // A fresh consumer in the same group sees only the new record.
        let second = Arc::new(Recorder::default());
        let consumer = Consumer::new(log.clone(), second.clone(), ConsumerConfig::new("observer"));
        assert_eq!(consumer.poll_once().await.unwrap(), 1);
        assert_eq!(*second.seen.lock().unwrap(), vec![json!(3)]);
    }

    #[tokio::test]
    async fn failing_record_is_redelivered_then_dropped() {
        let log = Arc::new(EventLog::new("events"));
        log.append("pe", json!("bad")).await;
        log.append("pe", json!("good")).await;

        let recorder = Arc::new(Recorder {
            fail_on: Some(json!("bad")),
            ..Recorder::default()
        });
        let mut config = ConsumerConfig::new("g");
        config.max_attempts = 2;
        let consumer = Consumer::new(log.clone(), recorder.clone(), config);

        assert_eq!(consumer.poll_once().await.unwrap(), 0);
        assert_eq!(log.checkpoint("g").await, 0);
        assert_eq!(consumer.poll_once().await.unwrap(), 2);
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![json!("bad"), json!("bad"), json!("good")]
        );
    }

    #[tokio::test]
    async fn spawned_consumer_delivers_new_records() {
        let log = Arc::new(EventLog::new("events"));
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = watch::channel(false);
        let handle = Consumer::new(log.clone(), recorder.clone(), ConsumerConfig::new("g")).spawn(rx);

        log.append("pe", json!("a")).await;
        for _ in 0..100 {
            if log.checkpoint("g").await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*recorder.seen.lock().unwrap(), vec![json!("a")]);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
