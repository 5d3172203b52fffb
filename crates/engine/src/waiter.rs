//! Wait/notify correlation registry.
//!
//! A waiter (a node execution id) registers the correlation ids it waits
//! on.  Each `notify` records one response; the call that records the last
//! missing one receives the complete map, so the waiter is resumed exactly
//! once no matter how the notifications interleave.  A notification that
//! arrives before its waiter registered is buffered; one for a wait that
//! already completed or was cancelled is dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use steps::ResponseData;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct Waiting {
    pending: BTreeSet<String>,
    responses: BTreeMap<String, ResponseData>,
}

#[derive(Debug, Default)]
struct State {
    waiters: HashMap<String, Waiting>,
    /// correlation id -> waiter id
    correlations: HashMap<String, String>,
    /// Responses whose waiter had not registered yet.
    early: HashMap<String, ResponseData>,
    /// Correlation ids of completed or cancelled waits, oldest first.
    retired: HashSet<String>,
    retired_order: VecDeque<String>,
}

/// Retired correlation ids remembered for late duplicates.
const RETIRED_CAPACITY: usize = 4096;

impl State {
    fn retire(&mut self, correlation_id: String) {
        if !self.retired.insert(correlation_id.clone()) {
            return;
        }
        self.retired_order.push_back(correlation_id);
        while self.retired_order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }
}

/// A completed wait: the waiter and every response, keyed by correlation id.
pub type Completed = (String, BTreeMap<String, ResponseData>);

#[derive(Debug, Default)]
pub struct WaitNotifyRegistry {
    state: Mutex<State>,
}

impl WaitNotifyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting on `correlation_ids`.  Returns the completed wait right
    /// away when every id was already notified.
    pub async fn register(&self, waiter_id: &str, correlation_ids: &[String]) -> Option<Completed> {
        let mut state = self.state.lock().await;
        let mut waiting = Waiting::default();
        for correlation_id in correlation_ids {
            match state.early.remove(correlation_id) {
                Some(data) => {
                    waiting.responses.insert(correlation_id.clone(), data);
                }
                None => {
                    waiting.pending.insert(correlation_id.clone());
                    state
                        .correlations
                        .insert(correlation_id.clone(), waiter_id.to_owned());
                }
            }
        }
        if waiting.pending.is_empty() {
            for correlation_id in waiting.responses.keys() {
                state.retire(correlation_id.clone());
            }
            return Some((waiter_id.to_owned(), waiting.responses));
        }
        state.waiters.insert(waiter_id.to_owned(), waiting);
        None
    }

    /// Record the response for `correlation_id`.
    pub async fn notify(&self, correlation_id: &str, data: ResponseData) -> Option<Completed> {
        let mut state = self.state.lock().await;
        let Some(waiter_id) = state.correlations.remove(correlation_id) else {
            if state.retired.contains(correlation_id) {
                debug!("correlation id {} already settled; dropping", correlation_id);
            } else {
                debug!("no waiter for correlation id {}; buffering", correlation_id);
                state.early.insert(correlation_id.to_owned(), data);
            }
            return None;
        };
        let waiting = state.waiters.get_mut(&waiter_id)?;
        waiting.pending.remove(correlation_id);
        waiting.responses.insert(correlation_id.to_owned(), data);
        if !waiting.pending.is_empty() {
            return None;
        }
        let waiting = state.waiters.remove(&waiter_id)?;
        for correlation_id in waiting.responses.keys() {
            state.retire(correlation_id.clone());
        }
        Some((waiter_id, waiting.responses))
    }

    /// Stop waiting.  Later notifications for its ids are dropped.
    pub async fn cancel(&self, waiter_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.waiters.remove(waiter_id) {
            Some(waiting) => {
                for correlation_id in waiting.pending.into_iter().chain(waiting.responses.into_keys()) {
                    state.correlations.remove(&correlation_id);
                    state.early.remove(&correlation_id);
                    state.retire(correlation_id);
                }
                true
            }
            None => false,
        }
    }

    pub async fn is_waiting(&self, waiter_id: &str) -> bool {
        self.state.lock().await.waiters.contains_key(waiter_id)
    }
}
