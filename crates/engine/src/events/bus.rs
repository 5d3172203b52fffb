//! The event bus.
//!
//! * Sync handlers run in registration order on the publisher.  An error or
//!   a panic is logged and the next handler still runs.
//! * Each async handler owns one worker task fed by an unbounded channel, so
//!   its events are handled strictly in publish order while the publisher
//!   never waits on it.
//! * When an event log is attached every event is appended to it, keyed by
//!   plan execution id, for out-of-process listeners.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use queue::EventLog;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{
    AsyncOrchestrationEventHandler, OrchestrationEvent, OrchestrationEventType,
    SyncOrchestrationEventHandler,
};

struct SyncRegistration {
    name: String,
    handler: Arc<dyn SyncOrchestrationEventHandler>,
}

/// Sending half of one async handler's worker.
#[derive(Clone)]
struct AsyncHandlerProxy {
    name: String,
    sender: mpsc::UnboundedSender<OrchestrationEvent>,
}

impl AsyncHandlerProxy {
    /// Spawn the worker.  Each event runs in its own task so a panicking
    /// handler does not take the worker down; the worker awaits it before
    /// taking the next event.
    fn spawn(name: String, handler: Arc<dyn AsyncOrchestrationEventHandler>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<OrchestrationEvent>();
        let worker_name = name.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let handler = handler.clone();
                let event_type = event.event_type;
                let run = tokio::spawn(async move { handler.handle(&event).await });
                match run.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("async event handler '{}' failed on {:?}: {:#}", worker_name, event_type, e)
                    }
                    Err(e) => error!("async event handler '{}' panicked on {:?}: {}", worker_name, event_type, e),
                }
            }
            debug!("async event handler '{}' stopped", worker_name);
        });
        Self { name, sender }
    }

    fn submit(&self, event: OrchestrationEvent) {
        if self.sender.send(event).is_err() {
            error!("async event handler '{}' is gone; event dropped", self.name);
        }
    }
}

#[derive(Default)]
pub struct EventBusBuilder {
    sync_handlers: Vec<(Vec<OrchestrationEventType>, SyncRegistration)>,
    async_handlers: Vec<(Vec<OrchestrationEventType>, String, Arc<dyn AsyncOrchestrationEventHandler>)>,
    event_log: Option<Arc<EventLog>>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every type in `types`.
    pub fn register_sync(
        mut self,
        types: &[OrchestrationEventType],
        name: impl Into<String>,
        handler: Arc<dyn SyncOrchestrationEventHandler>,
    ) -> Self {
        self.sync_handlers.push((
            types.to_vec(),
            SyncRegistration {
                name: name.into(),
                handler,
            },
        ));
        self
    }

    /// Register `handler` for every type in `types`.  One worker serves all
    /// of them, so ordering holds across types too.
    pub fn register_async(
        mut self,
        types: &[OrchestrationEventType],
        name: impl Into<String>,
        handler: Arc<dyn AsyncOrchestrationEventHandler>,
    ) -> Self {
        self.async_handlers.push((types.to_vec(), name.into(), handler));
        self
    }

    pub fn event_log(mut self, log: Arc<EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    /// Must be called inside a Tokio runtime: async workers start here.
    pub fn build(self) -> EventBus {
        let mut sync_handlers: HashMap<OrchestrationEventType, Vec<Arc<SyncRegistration>>> = HashMap::new();
        for (types, registration) in self.sync_handlers {
            let registration = Arc::new(registration);
            for event_type in types {
                sync_handlers.entry(event_type).or_default().push(registration.clone());
            }
        }

        let mut async_handlers: HashMap<OrchestrationEventType, Vec<AsyncHandlerProxy>> = HashMap::new();
        for (types, name, handler) in self.async_handlers {
            let proxy = AsyncHandlerProxy::spawn(name, handler);
            for event_type in types {
                async_handlers.entry(event_type).or_default().push(proxy.clone());
            }
        }

        EventBus {
            sync_handlers,
            async_handlers,
            event_log: self.event_log,
        }
    }
}

pub struct EventBus {
    sync_handlers: HashMap<OrchestrationEventType, Vec<Arc<SyncRegistration>>>,
    async_handlers: HashMap<OrchestrationEventType, Vec<AsyncHandlerProxy>>,
    event_log: Option<Arc<EventLog>>,
}

impl EventBus {
    /// A bus with no handlers and no log.
    pub fn empty() -> Self {
        EventBusBuilder::new().build()
    }

    pub fn event_log(&self) -> Option<&Arc<EventLog>> {
        self.event_log.as_ref()
    }

    /// Deliver `event`.  Never fails: handler and log problems are logged.
    pub async fn publish(&self, event: OrchestrationEvent) {
        if let Some(handlers) = self.sync_handlers.get(&event.event_type) {
            for registration in handlers {
                match catch_unwind(AssertUnwindSafe(|| registration.handler.handle(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(
                        "event handler '{}' failed on {:?}: {:#}",
                        registration.name, event.event_type, e
                    ),
                    Err(_) => error!(
                        "event handler '{}' panicked on {:?}",
                        registration.name, event.event_type
                    ),
                }
            }
        }

        if let Some(proxies) = self.async_handlers.get(&event.event_type) {
            for proxy in proxies {
                proxy.submit(event.clone());
            }
        }

        if let Some(log) = &self.event_log {
            let key = event.plan_execution_id().to_owned();
            if let Err(e) = log.append_json(key, &event).await {
                error!("failed to append {:?} to '{}': {}", event.event_type, log.name(), e);
            }
        }
    }
}
